use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::Properties;

/// Default result reported when a transaction ends successfully.
pub const TXN_SUCCESS: &str = "success";
/// Result that can be reported when a transaction ends unsuccessfully.
pub const TXN_ERROR: &str = "error";
/// Result reported when a transaction times out.
pub const TXN_TIMEOUT: &str = "timeout";

/// Default time a transaction stays open without updates.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(3600);

/// What activity keeps a transaction open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TimeoutMode {
    /// The transaction is kept open only by updates to itself.
    #[default]
    #[serde(rename = "TXN")]
    Transaction,
    /// The transaction is kept open by updates to any transaction of the current device or user.
    ///
    /// Not supported yet: behaves exactly like [`TimeoutMode::Transaction`].
    #[serde(rename = "ANY")]
    Any,
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Begun and neither ended nor timed out.
    Open,
    /// Ended by the application.
    Closed,
    /// Expired because it was not updated within its timeout.
    TimedOut,
}

impl TransactionState {
    /// Whether no further change can happen to the transaction.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TransactionState::Open)
    }
}

/// What a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    /// An application defined transaction.
    #[default]
    Custom,
    /// The application session. Always uses category [`SESSION_CATEGORY`].
    Session,
    /// A purchase. Always uses category [`PURCHASE_CATEGORY`].
    Purchase,
}

/// Category of session transactions.
pub const SESSION_CATEGORY: &str = "session";
/// Category of purchase transactions.
pub const PURCHASE_CATEGORY: &str = "Purchase";

/// Identifies one begun transaction instance inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionHandle(pub(crate) u64);

/// A transaction owned by the [`TransactionRegistry`](crate::TransactionRegistry).
#[derive(Debug, Clone)]
pub(crate) struct TrackedTransaction {
    pub category: String,
    pub transaction_id: Option<String>,
    pub properties: Properties,
    pub timeout: Duration,
    pub mode: TimeoutMode,
    pub progress: Option<i64>,
    pub last_activity: Instant,
}

impl TrackedTransaction {
    pub(crate) fn deadline(&self) -> Instant {
        self.last_activity + self.timeout
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > self.timeout
    }

    pub(crate) fn remaining(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }
}
