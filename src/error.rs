use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used throughout the SDK.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can be reported by the SDK, either returned directly or passed to a completion
/// callback.
///
/// No error is fatal: the session stays usable after any of them, falling back to cached tuning
/// values and keeping undelivered telemetry queued.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// An unspecified failure.
    #[error("unspecified failure")]
    Generic,

    /// The operation requires a prior successful `init`.
    #[error("splyt has not been initialized")]
    NotInitialized,

    /// `init` was called more than once.
    #[error("splyt has already been initialized")]
    AlreadyInitialized,

    /// A required argument is malformed or missing.
    #[error("invalid arguments: {0}")]
    InvalidArgs(&'static str),

    /// A required user or device identifier is missing or empty.
    #[error("user or device id is missing")]
    MissingId,

    /// A network request exceeded the configured request timeout.
    #[error("request timed out")]
    RequestTimedOut,

    /// The configured host is not a valid URL.
    #[error("invalid host configuration")]
    InvalidHost(#[source] url::ParseError),

    /// The collector answered with an error code.
    #[error("collector returned error {0:?}")]
    Collector(ErrorCode),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// An I/O error while reading or writing persisted state.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Persisted state or a collector response could not be (de)serialized.
    #[error(transparent)]
    Serialization(Arc<serde_json::Error>),

    /// The background delivery thread panicked. This should normally never happen.
    #[error("delivery thread panicked")]
    DeliveryThreadPanicked,
}

impl Error {
    /// Map this error onto the numeric error taxonomy shared with the other Splyt SDKs.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotInitialized => ErrorCode::NotInitialized,
            Error::AlreadyInitialized => ErrorCode::AlreadyInitialized,
            Error::InvalidArgs(_) | Error::InvalidHost(_) => ErrorCode::InvalidArgs,
            Error::MissingId => ErrorCode::MissingId,
            Error::RequestTimedOut => ErrorCode::RequestTimedOut,
            Error::Generic
            | Error::Collector(_)
            | Error::Network(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::DeliveryThreadPanicked => ErrorCode::Generic,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            return Error::RequestTimedOut;
        }
        Error::Network(Arc::new(value.without_url()))
    }
}

/// Numeric error codes, as reported by the collector and surfaced to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "i64", from = "i64")]
pub enum ErrorCode {
    /// No error.
    Success,
    /// Unspecified failure.
    Generic,
    /// Splyt has not been initialized.
    NotInitialized,
    /// Splyt has already been initialized.
    AlreadyInitialized,
    /// Invalid arguments were passed.
    InvalidArgs,
    /// The device or user id is missing or invalid.
    MissingId,
    /// A web request timed out.
    RequestTimedOut,
    /// A code outside of the known range.
    Unknown,
}

impl ErrorCode {
    /// Raw value of the code.
    pub const fn value(self) -> i64 {
        match self {
            ErrorCode::Success => 0,
            ErrorCode::Generic => -1,
            ErrorCode::NotInitialized => -2,
            ErrorCode::AlreadyInitialized => -3,
            ErrorCode::InvalidArgs => -4,
            ErrorCode::MissingId => -5,
            ErrorCode::RequestTimedOut => -6,
            ErrorCode::Unknown => -99,
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(value: i64) -> Self {
        match value {
            0 => ErrorCode::Success,
            -1 => ErrorCode::Generic,
            -2 => ErrorCode::NotInitialized,
            -3 => ErrorCode::AlreadyInitialized,
            -4 => ErrorCode::InvalidArgs,
            -5 => ErrorCode::MissingId,
            -6 => ErrorCode::RequestTimedOut,
            _ => ErrorCode::Unknown,
        }
    }
}

impl From<ErrorCode> for i64 {
    fn from(value: ErrorCode) -> Self {
        value.value()
    }
}

impl<T> From<&Result<T>> for ErrorCode {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ErrorCode::Success,
            Err(err) => err.code(),
        }
    }
}
