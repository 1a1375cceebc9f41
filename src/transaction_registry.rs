//! Tracking of open transactions and their timeouts.
//!
//! The registry owns every begun transaction. Operations record telemetry into an outbox that the
//! session drains into the [`EventQueue`](crate::EventQueue) after each call, so the registry
//! itself never needs to know about devices, users or delivery.
//!
//! Timeouts are swept lazily on every registry access and additionally from the delivery thread,
//! so an abandoned transaction never outlives its deadline by more than one delivery period.
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    event::{EventBody, EventKind},
    logging,
    properties::merge,
    storage::{load_json, save_json, Storage},
    transaction::{
        TimeoutMode, TrackedTransaction, TransactionHandle, TransactionState, DEFAULT_TRANSACTION_TIMEOUT,
        TXN_SUCCESS, TXN_TIMEOUT,
    },
    Error, Properties, PropertyValue, Result,
};

/// Storage key of the persisted open transactions.
pub(crate) const TRANSACTION_STATE_KEY: &str = "splyt_txnState";

/// How many finished handles are remembered for [`TransactionRegistry::state`].
const RETIRED_CAPACITY: usize = 4096;

/// Parameters of a transaction to begin.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    category: String,
    transaction_id: Option<String>,
    properties: Properties,
    timeout: Duration,
    mode: TimeoutMode,
}

impl NewTransaction {
    /// A transaction in `category` with the default timeout and mode.
    pub fn new(category: impl Into<String>) -> NewTransaction {
        NewTransaction {
            category: category.into(),
            transaction_id: None,
            properties: Properties::new(),
            timeout: DEFAULT_TRANSACTION_TIMEOUT,
            mode: TimeoutMode::default(),
        }
    }

    /// Distinguish concurrent transactions of the same category.
    pub fn transaction_id(mut self, transaction_id: impl Into<String>) -> NewTransaction {
        self.transaction_id = Some(transaction_id.into());
        self
    }

    /// Initial properties, reported with the begin event.
    pub fn properties(mut self, properties: Properties) -> NewTransaction {
        self.properties = properties;
        self
    }

    /// How long the transaction stays open without updates. Zero selects the default timeout.
    pub fn timeout(mut self, timeout: Duration) -> NewTransaction {
        self.timeout = if timeout.is_zero() {
            DEFAULT_TRANSACTION_TIMEOUT
        } else {
            timeout
        };
        self
    }

    /// What activity keeps the transaction open.
    pub fn mode(mut self, mode: TimeoutMode) -> NewTransaction {
        self.mode = mode;
        self
    }
}

/// Owns all live transactions and enforces their timeouts.
#[derive(Debug, Default)]
pub struct TransactionRegistry {
    open: BTreeMap<TransactionHandle, TrackedTransaction>,
    retired: HashMap<TransactionHandle, TransactionState>,
    retired_order: VecDeque<TransactionHandle>,
    next_handle: u64,
    outbox: Vec<EventBody>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistrySnapshot {
    next_handle: u64,
    transactions: Vec<TransactionSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransactionSnapshot {
    handle: TransactionHandle,
    category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    transaction_id: Option<String>,
    properties: Properties,
    timeout: Duration,
    mode: TimeoutMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    progress: Option<i64>,
    remaining: Duration,
}

impl TransactionRegistry {
    /// Create an empty registry.
    pub fn new() -> TransactionRegistry {
        TransactionRegistry::default()
    }

    /// Begin tracking a new transaction.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgs`] if the category is empty.
    pub fn begin(&mut self, txn: NewTransaction, now: Instant) -> Result<TransactionHandle> {
        self.sweep(now);

        if txn.category.is_empty() {
            return Err(Error::InvalidArgs("transaction category must not be empty"));
        }
        if txn.mode == TimeoutMode::Any {
            logging::log_debug!(category = txn.category.as_str();
                "timeout mode Any is not supported yet, using Transaction mode");
        }

        let handle = TransactionHandle(self.next_handle);
        self.next_handle += 1;

        let transaction = TrackedTransaction {
            category: txn.category,
            transaction_id: txn.transaction_id,
            properties: txn.properties,
            timeout: txn.timeout,
            mode: txn.mode,
            progress: None,
            last_activity: now,
        };

        let mut payload = identity_payload(&transaction);
        payload.insert("timeout".to_owned(), json!(transaction.timeout.as_secs_f64()));
        payload.insert("mode".to_owned(), json!(transaction.mode));
        payload.insert("properties".to_owned(), json!(transaction.properties));
        self.outbox
            .push(EventBody::new(EventKind::TransactionBegin, payload));

        logging::log_trace!(category = transaction.category.as_str(), handle = handle.0;
            "transaction begun");
        self.open.insert(handle, transaction);
        Ok(handle)
    }

    /// Merge a single property into an open transaction.
    ///
    /// Returns the state of the transaction, or `None` if the handle is unknown. Calls on a closed
    /// or timed out transaction have no effect.
    pub fn set_property(
        &mut self,
        handle: TransactionHandle,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
        now: Instant,
    ) -> Option<TransactionState> {
        let update = Properties::from([(key.into(), value.into())]);
        self.set_properties(handle, update, now)
    }

    /// Merge properties into an open transaction. Later keys override earlier ones.
    ///
    /// Returns the state of the transaction, or `None` if the handle is unknown. Calls on a closed
    /// or timed out transaction have no effect.
    pub fn set_properties(
        &mut self,
        handle: TransactionHandle,
        properties: Properties,
        now: Instant,
    ) -> Option<TransactionState> {
        self.sweep(now);
        match self.open.get_mut(&handle) {
            Some(transaction) => {
                merge(&mut transaction.properties, properties);
                Some(TransactionState::Open)
            }
            None => self.finished_state(handle),
        }
    }

    /// Report progress of an open transaction and reset its timeout.
    ///
    /// `progress` is passed through unchanged; callers are expected to report increasing values.
    pub fn update_at_progress(
        &mut self,
        handle: TransactionHandle,
        progress: i64,
        now: Instant,
    ) -> Option<TransactionState> {
        self.sweep(now);
        let Some(transaction) = self.open.get_mut(&handle) else {
            return self.finished_state(handle);
        };

        transaction.progress = Some(progress);
        transaction.last_activity = now;

        let mut payload = identity_payload(transaction);
        payload.insert("progress".to_owned(), json!(progress));
        payload.insert("properties".to_owned(), json!(transaction.properties));
        self.outbox
            .push(EventBody::new(EventKind::TransactionUpdate, payload));
        Some(TransactionState::Open)
    }

    /// End an open transaction with `result` (see [`TXN_SUCCESS`](crate::TXN_SUCCESS)).
    pub fn end(
        &mut self,
        handle: TransactionHandle,
        result: &str,
        now: Instant,
    ) -> Option<TransactionState> {
        self.sweep(now);
        let Some(transaction) = self.open.remove(&handle) else {
            return self.finished_state(handle);
        };

        self.outbox.push(end_event(
            EventKind::TransactionEnd,
            &transaction,
            result,
        ));
        self.retire(handle, TransactionState::Closed);
        Some(TransactionState::Closed)
    }

    /// Report an instantaneous transaction. Nothing is tracked.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgs`] if the category is empty.
    pub fn begin_and_end(&mut self, txn: NewTransaction, result: Option<&str>, now: Instant) -> Result<()> {
        self.sweep(now);
        if txn.category.is_empty() {
            return Err(Error::InvalidArgs("transaction category must not be empty"));
        }

        let transaction = TrackedTransaction {
            category: txn.category,
            transaction_id: txn.transaction_id,
            properties: txn.properties,
            timeout: txn.timeout,
            mode: txn.mode,
            progress: None,
            last_activity: now,
        };
        self.outbox.push(end_event(
            EventKind::TransactionBeginAndEnd,
            &transaction,
            result.unwrap_or(TXN_SUCCESS),
        ));
        Ok(())
    }

    /// Expire every open transaction whose timeout has elapsed. Returns how many expired.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<TransactionHandle> = self
            .open
            .iter()
            .filter(|(_, transaction)| transaction.is_expired(now))
            .map(|(handle, _)| *handle)
            .collect();

        for handle in &expired {
            if let Some(transaction) = self.open.remove(handle) {
                logging::log_debug!(category = transaction.category.as_str(), handle = handle.0;
                    "transaction timed out");
                self.outbox
                    .push(end_event(EventKind::TransactionEnd, &transaction, TXN_TIMEOUT));
                self.retire(*handle, TransactionState::TimedOut);
            }
        }
        expired.len()
    }

    /// Push every open deadline back by `delay`, the time the clock stood still.
    pub fn extend_deadlines(&mut self, delay: Duration) {
        for transaction in self.open.values_mut() {
            if let Some(last_activity) = transaction.last_activity.checked_add(delay) {
                transaction.last_activity = last_activity;
            }
        }
    }

    /// Current state of a transaction, or `None` if the handle is unknown.
    pub fn state(&self, handle: TransactionHandle) -> Option<TransactionState> {
        if self.open.contains_key(&handle) {
            return Some(TransactionState::Open);
        }
        self.finished_state(handle)
    }

    /// Properties accumulated by an open transaction.
    pub fn properties(&self, handle: TransactionHandle) -> Option<&Properties> {
        self.open.get(&handle).map(|transaction| &transaction.properties)
    }

    /// Time left before an open transaction times out.
    pub fn remaining(&self, handle: TransactionHandle, now: Instant) -> Option<Duration> {
        self.open.get(&handle).map(|transaction| transaction.remaining(now))
    }

    /// Number of open transactions.
    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Take the events recorded since the last call.
    pub(crate) fn take_emitted(&mut self) -> Vec<EventBody> {
        std::mem::take(&mut self.outbox)
    }

    /// Write the open transactions and their remaining timeout budgets to `storage`.
    pub fn persist(&self, storage: &dyn Storage, now: Instant) -> Result<()> {
        let snapshot = RegistrySnapshot {
            next_handle: self.next_handle,
            transactions: self
                .open
                .iter()
                .map(|(handle, transaction)| TransactionSnapshot {
                    handle: *handle,
                    category: transaction.category.clone(),
                    transaction_id: transaction.transaction_id.clone(),
                    properties: transaction.properties.clone(),
                    timeout: transaction.timeout,
                    mode: transaction.mode,
                    progress: transaction.progress,
                    remaining: transaction.remaining(now),
                })
                .collect(),
        };
        save_json(storage, TRANSACTION_STATE_KEY, &snapshot)
    }

    /// Replace the open transactions with the snapshot in `storage`. Each transaction keeps the
    /// timeout budget it had when persisted, counted from `now`.
    ///
    /// Does nothing if no snapshot has been persisted. Returns whether a snapshot was found.
    pub fn restore(&mut self, storage: &dyn Storage, now: Instant) -> Result<bool> {
        let Some(snapshot) = load_json::<RegistrySnapshot>(storage, TRANSACTION_STATE_KEY)? else {
            return Ok(false);
        };

        self.open.clear();
        for txn in snapshot.transactions {
            let elapsed = txn.timeout.saturating_sub(txn.remaining);
            self.open.insert(
                txn.handle,
                TrackedTransaction {
                    category: txn.category,
                    transaction_id: txn.transaction_id,
                    properties: txn.properties,
                    timeout: txn.timeout,
                    mode: txn.mode,
                    progress: txn.progress,
                    last_activity: now.checked_sub(elapsed).unwrap_or(now),
                },
            );
        }
        let max_handle = self.open.keys().next_back().map_or(0, |handle| handle.0 + 1);
        self.next_handle = self.next_handle.max(snapshot.next_handle).max(max_handle);
        logging::log_debug!(transactions = self.open.len(); "restored open transactions");
        Ok(true)
    }

    fn finished_state(&self, handle: TransactionHandle) -> Option<TransactionState> {
        let state = self.retired.get(&handle).copied();
        if state.is_some() {
            logging::log_debug!(handle = handle.0; "ignoring call on a finished transaction");
        }
        state
    }

    fn retire(&mut self, handle: TransactionHandle, state: TransactionState) {
        if self.retired_order.len() >= RETIRED_CAPACITY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
        self.retired.insert(handle, state);
        self.retired_order.push_back(handle);
    }
}

fn identity_payload(transaction: &TrackedTransaction) -> HashMap<String, serde_json::Value> {
    let mut payload = HashMap::from([("category".to_owned(), json!(transaction.category))]);
    if let Some(transaction_id) = &transaction.transaction_id {
        payload.insert("transactionId".to_owned(), json!(transaction_id));
    }
    payload
}

fn end_event(kind: EventKind, transaction: &TrackedTransaction, result: &str) -> EventBody {
    let mut payload = identity_payload(transaction);
    payload.insert("result".to_owned(), json!(result));
    payload.insert("properties".to_owned(), json!(transaction.properties));
    EventBody::new(kind, payload)
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{NewTransaction, TransactionRegistry};
    use crate::{
        event::EventKind, storage::MemoryStorage, Error, PropertyValue, TimeoutMode,
        TransactionState,
    };

    #[test]
    fn begin_then_end_emits_pair_and_untracks() {
        let now = Instant::now();
        let mut registry = TransactionRegistry::new();

        let handle = registry
            .begin(NewTransaction::new("Tutorial").transaction_id("step1"), now)
            .unwrap();
        assert_eq!(registry.end(handle, "success", now), Some(TransactionState::Closed));

        let kinds: Vec<_> = registry.take_emitted().iter().map(|e| e.kind).collect();
        assert_eq!(kinds, [EventKind::TransactionBegin, EventKind::TransactionEnd]);
        assert_eq!(registry.open_count(), 0);
        assert_eq!(registry.state(handle), Some(TransactionState::Closed));
    }

    #[test]
    fn empty_category_is_rejected() {
        let mut registry = TransactionRegistry::new();
        let result = registry.begin(NewTransaction::new(""), Instant::now());
        assert!(matches!(result, Err(Error::InvalidArgs(_))));
        assert!(registry.take_emitted().is_empty());

        let result = registry.begin_and_end(NewTransaction::new(""), None, Instant::now());
        assert!(matches!(result, Err(Error::InvalidArgs(_))));
    }

    #[test]
    fn any_mode_behaves_like_transaction_mode() {
        let now = Instant::now();
        let mut registry = TransactionRegistry::new();
        let handle = registry
            .begin(
                NewTransaction::new("Level")
                    .timeout(Duration::from_secs(5))
                    .mode(TimeoutMode::Any),
                now,
            )
            .unwrap();

        registry.sweep(now + Duration::from_secs(6));
        assert_eq!(registry.state(handle), Some(TransactionState::TimedOut));
    }

    #[test]
    fn zero_timeout_uses_default() {
        let now = Instant::now();
        let mut registry = TransactionRegistry::new();
        let handle = registry
            .begin(NewTransaction::new("Level").timeout(Duration::ZERO), now)
            .unwrap();
        assert_eq!(registry.remaining(handle, now), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn properties_are_cumulative() {
        let now = Instant::now();
        let mut registry = TransactionRegistry::new();
        let handle = registry.begin(NewTransaction::new("Shop"), now).unwrap();

        registry.set_property(handle, "item", "sword", now);
        registry.set_property(handle, "count", 1.0, now);
        registry.set_property(handle, "item", "shield", now);

        let properties = registry.properties(handle).unwrap();
        assert_eq!(properties["item"], PropertyValue::from("shield"));
        assert_eq!(properties["count"], PropertyValue::Number(1.0));
    }

    #[test]
    fn timeout_emits_exactly_one_close_and_stays_terminal() {
        let now = Instant::now();
        let mut registry = TransactionRegistry::new();
        let handle = registry
            .begin(NewTransaction::new("Level").timeout(Duration::from_secs(10)), now)
            .unwrap();
        registry.take_emitted();

        let later = now + Duration::from_secs(11);
        assert_eq!(
            registry.update_at_progress(handle, 50, later),
            Some(TransactionState::TimedOut)
        );
        assert_eq!(registry.end(handle, "success", later), Some(TransactionState::TimedOut));
        assert_eq!(
            registry.set_property(handle, "k", "v", later),
            Some(TransactionState::TimedOut)
        );
        registry.sweep(later + Duration::from_secs(100));

        let emitted = registry.take_emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].kind, EventKind::TransactionEnd);
        assert_eq!(emitted[0].payload["result"], "timeout");
    }

    #[test]
    fn extended_deadline_survives_the_delay() {
        let now = Instant::now();
        let mut registry = TransactionRegistry::new();
        let handle = registry
            .begin(NewTransaction::new("Level").timeout(Duration::from_secs(10)), now)
            .unwrap();

        registry.extend_deadlines(Duration::from_secs(60));
        assert_eq!(registry.sweep(now + Duration::from_secs(65)), 0);
        assert_eq!(
            registry.remaining(handle, now + Duration::from_secs(65)),
            Some(Duration::from_secs(5))
        );
        assert_eq!(registry.sweep(now + Duration::from_secs(71)), 1);
    }

    #[test]
    fn update_resets_the_deadline_and_passes_progress_through() {
        let now = Instant::now();
        let mut registry = TransactionRegistry::new();
        let handle = registry
            .begin(NewTransaction::new("Level").timeout(Duration::from_secs(10)), now)
            .unwrap();

        registry.update_at_progress(handle, 250, now + Duration::from_secs(8));
        registry.update_at_progress(handle, -3, now + Duration::from_secs(16));
        assert_eq!(registry.state(handle), Some(TransactionState::Open));

        let emitted = registry.take_emitted();
        assert_eq!(emitted[1].payload["progress"], 250);
        assert_eq!(emitted[2].payload["progress"], -3);
    }

    #[test]
    fn end_carries_accumulated_properties() {
        let now = Instant::now();
        let mut registry = TransactionRegistry::new();
        let handle = registry.begin(NewTransaction::new("Shop"), now).unwrap();
        registry.set_property(handle, "item", "sword", now);
        registry.end(handle, "cancelled", now);

        let emitted = registry.take_emitted();
        let end = emitted.last().unwrap();
        assert_eq!(end.payload["result"], "cancelled");
        assert_eq!(end.payload["properties"]["item"], "sword");
    }

    #[test]
    fn same_category_and_id_begins_a_distinct_instance() {
        let now = Instant::now();
        let mut registry = TransactionRegistry::new();
        let first = registry
            .begin(NewTransaction::new("Level").transaction_id("1"), now)
            .unwrap();
        registry.end(first, "success", now);

        let second = registry
            .begin(NewTransaction::new("Level").transaction_id("1"), now)
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(registry.state(first), Some(TransactionState::Closed));
        assert_eq!(registry.state(second), Some(TransactionState::Open));
    }

    #[test]
    fn begin_and_end_is_never_tracked() {
        let now = Instant::now();
        let mut registry = TransactionRegistry::new();
        registry
            .begin_and_end(NewTransaction::new("ButtonClick"), None, now)
            .unwrap();

        assert_eq!(registry.open_count(), 0);
        let emitted = registry.take_emitted();
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].kind, EventKind::TransactionBeginAndEnd);
        assert_eq!(emitted[0].payload["result"], "success");
    }

    #[test]
    fn persist_then_restore_keeps_open_transactions_and_budgets() {
        let storage = MemoryStorage::new();
        let now = Instant::now();
        let mut registry = TransactionRegistry::new();
        let open = registry
            .begin(
                NewTransaction::new("Level")
                    .transaction_id("7")
                    .timeout(Duration::from_secs(100)),
                now,
            )
            .unwrap();
        registry.set_property(open, "boss", true, now);
        let closed = registry.begin(NewTransaction::new("Shop"), now).unwrap();
        registry.end(closed, "success", now);

        let persisted_at = now + Duration::from_secs(30);
        registry.persist(&storage, persisted_at).unwrap();

        // Time spent paused does not count against the budget.
        let resumed_at = persisted_at + Duration::from_secs(500);
        let mut restored = TransactionRegistry::new();
        assert!(restored.restore(&storage, resumed_at).unwrap());

        assert_eq!(restored.open_count(), 1);
        assert_eq!(restored.state(open), Some(TransactionState::Open));
        assert_eq!(restored.remaining(open, resumed_at), Some(Duration::from_secs(70)));
        assert_eq!(restored.properties(open), registry.properties(open));

        // New handles never collide with restored ones.
        let next = restored.begin(NewTransaction::new("Shop"), resumed_at).unwrap();
        assert!(next > closed);
    }
}
