use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Key-value properties attached to transactions, entities and state updates.
///
/// # Examples
/// ```
/// # use splyt::{Properties, PropertyValue};
/// let properties = [
///     ("level".to_owned(), 3.0.into()),
///     ("hardMode".to_owned(), true.into()),
///     ("character".to_owned(), "wizard".into()),
/// ].into_iter().collect::<Properties>();
/// assert_eq!(properties["level"], PropertyValue::Number(3.0));
/// ```
pub type Properties = HashMap<String, PropertyValue>;

/// A single property value. Values may nest through [`PropertyValue::Object`].
#[derive(Debug, Serialize, Deserialize, PartialEq, From, Clone)]
#[serde(untagged)]
pub enum PropertyValue {
    /// A string value.
    String(String),
    /// A numerical value.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A nested property map.
    Object(Properties),
    /// A null value or absence of value.
    Null,
}

impl PropertyValue {
    /// Returns the string if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the number if this is a numeric value.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Number(value.into())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

/// Merge `update` into `target`; keys from `update` win.
pub(crate) fn merge(target: &mut Properties, update: Properties) {
    target.extend(update);
}
