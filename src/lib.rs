//! The Rust SDK for Splyt, an analytics and live tuning platform for games and applications.
//!
//! # Overview
//!
//! The SDK revolves around a [`SessionController`] that tracks one device and, optionally, an
//! active user. Applications report what happens through [`Instrumentation`]: transactions with a
//! beginning and an end (levels, tutorial steps, purchases), and updates to device state, user
//! state and collections. Each report becomes an [`Event`] in a bounded, persistable
//! [`EventQueue`] that is delivered to the collector in batches by a background thread.
//!
//! Tuning variables downloaded during [`SessionController::init`] and
//! [`SessionController::register_user`] are read through [`Tuning`]. Reads never block on the
//! network and fall back to the supplied default.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum and map onto numeric [`ErrorCode`]s.
//!
//! No error is fatal. In production, it is recommended to ignore errors from instrumentation
//! calls: the session keeps undelivered events queued and keeps serving cached tuning values.
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages with
//! the `splyt` target. Output is off unless enabled with [`InitParams::log_enabled`].
//!
//! # Examples
//!
//! An example can be found in the `demos/` directory of the `splyt` crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod collector;
mod completion;
mod config;
mod delivery;
mod entity;
mod error;
mod event;
mod event_queue;
mod instrumentation;
mod logging;
mod properties;
mod purchase;
mod session;
mod storage;
mod transaction;
mod transaction_registry;
mod transport;
mod tuning;

pub use completion::Completion;
pub use config::{DeliveryConfig, InitParams};
pub use delivery::FlushOutcome;
pub use entity::{EntityInfo, EntityType};
pub use error::{Error, ErrorCode, Result};
pub use event::{Event, EventKind};
pub use event_queue::EventQueue;
pub use instrumentation::{Instrumentation, Transaction};
pub use properties::{Properties, PropertyValue};
pub use purchase::{normalize_currency, Purchase, UNKNOWN_CURRENCY};
pub use session::{InitStatus, SessionController};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use transaction::{
    TimeoutMode, TransactionHandle, TransactionKind, TransactionState,
    DEFAULT_TRANSACTION_TIMEOUT, PURCHASE_CATEGORY, SESSION_CATEGORY, TXN_ERROR, TXN_SUCCESS,
    TXN_TIMEOUT,
};
pub use transaction_registry::{NewTransaction, TransactionRegistry};
pub use transport::{HttpTransport, Transport};
pub use tuning::{Tuning, TuningCache, TuningValue, TuningVar};
