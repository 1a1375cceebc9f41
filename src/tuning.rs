//! Dynamic tuning variables.
//!
//! Tuning values are assigned by the collector and cached locally during
//! [`init`](crate::SessionController::init), [`register_user`](crate::SessionController::register_user)
//! and [`refresh`](crate::SessionController::refresh). Reading a variable never touches the network
//! and never waits on a writer: readers clone an `Arc` to the last published [`TuningCache`].
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
};

use derive_more::From;
use serde::{Deserialize, Serialize};

use crate::{
    logging,
    storage::{load_json, save_json, Storage},
    Result,
};

/// Storage key of the persisted tuning cache.
pub(crate) const TUNING_CACHE_KEY: &str = "splyt_tuningCache";

/// A tuning value assigned by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, From)]
#[serde(untagged)]
pub enum TuningValue {
    /// A numeric value.
    Number(f64),
    /// A string value.
    String(String),
}

impl TuningValue {
    /// Convert a raw collector value. Values of other JSON types are not supported.
    fn from_json(value: serde_json::Value) -> Option<TuningValue> {
        match value {
            serde_json::Value::Number(n) => n.as_f64().map(TuningValue::Number),
            serde_json::Value::String(s) => Some(TuningValue::String(s)),
            _ => None,
        }
    }
}

/// Types that can be read with [`Tuning::get_var`].
///
/// A value converts only when its type matches: strings never parse into numbers, and integers are
/// only read from numbers without a fractional part that fit the target type.
pub trait TuningVar: Sized {
    /// Convert a cached value, returning `None` on a type mismatch.
    fn from_tuning(value: &TuningValue) -> Option<Self>;
}

impl TuningVar for f64 {
    fn from_tuning(value: &TuningValue) -> Option<Self> {
        match value {
            TuningValue::Number(n) => Some(*n),
            TuningValue::String(_) => None,
        }
    }
}

impl TuningVar for f32 {
    fn from_tuning(value: &TuningValue) -> Option<Self> {
        f64::from_tuning(value).map(|n| n as f32)
    }
}

impl TuningVar for i64 {
    fn from_tuning(value: &TuningValue) -> Option<Self> {
        let n = f64::from_tuning(value)?;
        // i64::MAX is not representable as f64, so the upper bound is exclusive.
        if n.fract() != 0.0 || n < i64::MIN as f64 || n >= i64::MAX as f64 {
            return None;
        }
        Some(n as i64)
    }
}

impl TuningVar for i32 {
    fn from_tuning(value: &TuningValue) -> Option<Self> {
        i64::from_tuning(value).and_then(|n| i32::try_from(n).ok())
    }
}

impl TuningVar for String {
    fn from_tuning(value: &TuningValue) -> Option<Self> {
        match value {
            TuningValue::String(s) => Some(s.clone()),
            TuningValue::Number(_) => None,
        }
    }
}

/// Tuning data returned by the collector.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TuningData {
    #[serde(default)]
    pub device_tuning: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub user_tuning: HashMap<String, HashMap<String, serde_json::Value>>,
}

/// A published set of tuning values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningCache {
    device: HashMap<String, TuningValue>,
    users: HashMap<String, HashMap<String, TuningValue>>,
    #[serde(skip)]
    active_user: Option<String>,
}

fn convert(values: HashMap<String, serde_json::Value>) -> HashMap<String, TuningValue> {
    values
        .into_iter()
        .filter_map(|(name, value)| TuningValue::from_json(value).map(|value| (name, value)))
        .collect()
}

impl TuningCache {
    /// Look up `name`, preferring the active user's value over the device value.
    pub fn get(&self, name: &str) -> Option<&TuningValue> {
        self.active_user
            .as_ref()
            .and_then(|user| self.users.get(user))
            .and_then(|values| values.get(name))
            .or_else(|| self.device.get(name))
    }

    /// User whose values take precedence.
    pub fn active_user(&self) -> Option<&str> {
        self.active_user.as_deref()
    }

    /// Replace the device values and the values of every user present in `data`.
    pub(crate) fn apply(&mut self, data: TuningData) {
        if let Some(device) = data.device_tuning {
            self.device = convert(device);
        }
        for (user_id, values) in data.user_tuning {
            self.users.insert(user_id, convert(values));
        }
    }
}

/// Concurrent storage of the tuning cache. Readers get the last published snapshot.
#[derive(Debug, Default)]
pub(crate) struct TuningStore {
    cache: RwLock<Arc<TuningCache>>,
    // Serializes writers so concurrent updates are not lost.
    writer: Mutex<()>,
}

impl TuningStore {
    pub fn new() -> TuningStore {
        TuningStore::default()
    }

    pub fn snapshot(&self) -> Arc<TuningCache> {
        // The lock is only poisoned if a writer panicked while swapping the pointer, in which case
        // the previous snapshot is still intact.
        match self.cache.read() {
            Ok(cache) => cache.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Publish a modified copy of the current cache.
    pub fn update(&self, f: impl FnOnce(&mut TuningCache)) {
        let _writer = self.writer.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Constructing new value before requesting the lock to minimize lock span.
        let mut next = TuningCache::clone(&self.snapshot());
        f(&mut next);
        let next = Arc::new(next);

        match self.cache.write() {
            Ok(mut slot) => *slot = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn apply(&self, data: TuningData) {
        self.update(|cache| cache.apply(data));
    }

    pub fn set_active_user(&self, user_id: Option<String>) {
        self.update(|cache| cache.active_user = user_id);
    }

    pub fn persist(&self, storage: &dyn Storage) -> Result<()> {
        save_json(storage, TUNING_CACHE_KEY, &*self.snapshot())
    }

    /// Load a persisted cache, keeping the current active user. Returns whether one was found.
    pub fn restore(&self, storage: &dyn Storage) -> Result<bool> {
        let Some(restored) = load_json::<TuningCache>(storage, TUNING_CACHE_KEY)? else {
            return Ok(false);
        };
        self.update(|cache| {
            cache.device = restored.device;
            cache.users = restored.users;
        });
        logging::log_debug!("restored tuning cache");
        Ok(true)
    }
}

/// Read access to tuning variables.
///
/// Obtained from [`SessionController::tuning`](crate::SessionController::tuning). Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Tuning {
    store: Arc<TuningStore>,
}

impl Tuning {
    pub(crate) fn new(store: Arc<TuningStore>) -> Tuning {
        Tuning { store }
    }

    /// Get the value of the tuning variable `name`.
    ///
    /// Returns `default` if the variable is not set, or is set to a value of another type.
    ///
    /// ```
    /// # fn f(tuning: &splyt::Tuning) {
    /// let lives: i32 = tuning.get_var("startingLives", 3);
    /// let greeting: String = tuning.get_var("greeting", "Welcome!".to_owned());
    /// # }
    /// ```
    pub fn get_var<T: TuningVar>(&self, name: &str, default: T) -> T {
        let cache = self.store.snapshot();
        let Some(value) = cache.get(name) else {
            return default;
        };
        match T::from_tuning(value) {
            Some(value) => value,
            None => {
                logging::log_debug!(name; "tuning variable has an incompatible type, using default");
                default
            }
        }
    }

    /// Get the value of a string tuning variable. See [`Tuning::get_var`].
    pub fn get_var_str(&self, name: &str, default: &str) -> String {
        match self.store.snapshot().get(name) {
            Some(TuningValue::String(s)) => s.clone(),
            _ => default.to_owned(),
        }
    }

    /// The current snapshot of all tuning values.
    pub fn cache(&self) -> Arc<TuningCache> {
        self.store.snapshot()
    }
}
