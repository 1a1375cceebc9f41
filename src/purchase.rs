//! Purchase details attached to transactions.
use std::sync::OnceLock;

use regex::Regex;

use crate::{Properties, PropertyValue};

/// Currency reported when a symbol matches several real currencies.
pub const UNKNOWN_CURRENCY: &str = "unknown";

/// Active ISO 4217 currency codes.
const CURRENCY_CODES: &[&str] = &[
    "AED", "AFN", "ALL", "AMD", "ANG", "AOA", "ARS", "AUD", "AWG", "AZN", "BAM", "BBD", "BDT",
    "BGN", "BHD", "BIF", "BMD", "BND", "BOB", "BRL", "BSD", "BTN", "BWP", "BYN", "BZD", "CAD",
    "CDF", "CHF", "CLP", "CNY", "COP", "CRC", "CUP", "CVE", "CZK", "DJF", "DKK", "DOP", "DZD",
    "EGP", "ERN", "ETB", "EUR", "FJD", "FKP", "GBP", "GEL", "GHS", "GIP", "GMD", "GNF", "GTQ",
    "GYD", "HKD", "HNL", "HTG", "HUF", "IDR", "ILS", "INR", "IQD", "IRR", "ISK", "JMD", "JOD",
    "JPY", "KES", "KGS", "KHR", "KMF", "KPW", "KRW", "KWD", "KYD", "KZT", "LAK", "LBP", "LKR",
    "LRD", "LSL", "LYD", "MAD", "MDL", "MGA", "MKD", "MMK", "MNT", "MOP", "MRU", "MUR", "MVR",
    "MWK", "MXN", "MYR", "MZN", "NAD", "NGN", "NIO", "NOK", "NPR", "NZD", "OMR", "PAB", "PEN",
    "PGK", "PHP", "PKR", "PLN", "PYG", "QAR", "RON", "RSD", "RUB", "RWF", "SAR", "SBD", "SCR",
    "SDG", "SEK", "SGD", "SHP", "SLE", "SOS", "SRD", "SSP", "STN", "SYP", "SZL", "THB", "TJS",
    "TMT", "TND", "TOP", "TRY", "TTD", "TWD", "TZS", "UAH", "UGX", "USD", "UYU", "UZS", "VES",
    "VND", "VUV", "WST", "XAF", "XCD", "XOF", "XPF", "YER", "ZAR", "ZMW", "ZWL",
];

/// Currency symbols that identify exactly one currency.
const CURRENCY_SYMBOLS: &[(&str, &str)] = &[
    ("€", "EUR"),
    ("£", "GBP"),
    ("₹", "INR"),
    ("₩", "KRW"),
    ("₽", "RUB"),
    ("₺", "TRY"),
    ("₪", "ILS"),
    ("₫", "VND"),
    ("฿", "THB"),
    ("₱", "PHP"),
    ("₴", "UAH"),
    ("₦", "NGN"),
    ("₡", "CRC"),
    ("₲", "PYG"),
    ("₸", "KZT"),
    ("₵", "GHS"),
    ("₼", "AZN"),
    ("₾", "GEL"),
    ("ZŁ", "PLN"),
    ("KČ", "CZK"),
    ("FT", "HUF"),
    ("R$", "BRL"),
    ("US$", "USD"),
    ("C$", "CAD"),
    ("A$", "AUD"),
    ("NZ$", "NZD"),
    ("HK$", "HKD"),
    ("S$", "SGD"),
];

/// Currency symbols shared by several currencies.
const AMBIGUOUS_SYMBOLS: &[&str] = &["$", "¥", "KR"];

/// Turn an application supplied currency into the string reported to the collector.
///
/// - ISO 4217 codes are accepted in any case and reported upper-cased.
/// - Symbols are translated to their code, or to [`UNKNOWN_CURRENCY`] when the symbol is shared by
///   several currencies.
/// - Anything else names a virtual currency and is reported with non-ASCII characters removed.
///
/// ```
/// # use splyt::normalize_currency;
/// assert_eq!(normalize_currency("usd"), "USD");
/// assert_eq!(normalize_currency("€"), "EUR");
/// assert_eq!(normalize_currency("$"), "unknown");
/// assert_eq!(normalize_currency("gems💎"), "gems");
/// ```
pub fn normalize_currency(currency: &str) -> String {
    let upper = currency.trim().to_uppercase();
    if CURRENCY_CODES.contains(&upper.as_str()) {
        return upper;
    }
    if let Some((_, code)) = CURRENCY_SYMBOLS.iter().find(|(symbol, _)| *symbol == upper) {
        return (*code).to_owned();
    }
    if AMBIGUOUS_SYMBOLS.contains(&upper.as_str()) {
        return UNKNOWN_CURRENCY.to_owned();
    }

    static NON_ASCII: OnceLock<Option<Regex>> = OnceLock::new();
    let stripped: String = match NON_ASCII.get_or_init(|| Regex::new(r"[^\x00-\x7F]+").ok()) {
        Some(re) => re.replace_all(currency, "").into_owned(),
        None => currency.chars().filter(char::is_ascii).collect(),
    };
    if stripped.trim().is_empty() {
        return UNKNOWN_CURRENCY.to_owned();
    }
    stripped
}

/// Purchase details that can be attached to any transaction, most commonly a
/// [`purchase_transaction`](crate::Instrumentation::purchase_transaction).
///
/// ```
/// # use splyt::Purchase;
/// let purchase = Purchase::new()
///     .price(0.99, "usd")
///     .offer_id("starter-pack")
///     .item_name("Gems x100")
///     .point_of_sale("store");
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Purchase {
    price: Option<(String, f64)>,
    offer_id: Option<String>,
    item_name: Option<String>,
    point_of_sale: Option<String>,
}

impl Purchase {
    /// Empty purchase details.
    pub fn new() -> Purchase {
        Purchase::default()
    }

    /// Price paid. `currency` is an ISO 4217 code, a currency symbol, or the name of a virtual
    /// currency. See [`normalize_currency`].
    pub fn price(mut self, amount: f64, currency: &str) -> Purchase {
        self.price = Some((normalize_currency(currency), amount));
        self
    }

    /// Identifier of the purchased offer.
    pub fn offer_id(mut self, offer_id: impl Into<String>) -> Purchase {
        self.offer_id = Some(offer_id.into());
        self
    }

    /// Name of the purchased item.
    pub fn item_name(mut self, item_name: impl Into<String>) -> Purchase {
        self.item_name = Some(item_name.into());
        self
    }

    /// Where in the application the purchase happened.
    pub fn point_of_sale(mut self, point_of_sale: impl Into<String>) -> Purchase {
        self.point_of_sale = Some(point_of_sale.into());
        self
    }

    pub(crate) fn properties(&self) -> Properties {
        let mut properties = Properties::new();
        if let Some((currency, amount)) = &self.price {
            let price = Properties::from([(currency.clone(), PropertyValue::Number(*amount))]);
            properties.insert("price".to_owned(), price.into());
        }
        for (key, value) in [
            ("offerId", &self.offer_id),
            ("itemName", &self.item_name),
            ("pointOfSale", &self.point_of_sale),
        ] {
            if let Some(value) = value {
                properties.insert(key.to_owned(), value.as_str().into());
            }
        }
        properties
    }
}
