//! SDK log output.
//!
//! All messages go through the [`log`] facade with the `splyt` target, so any `log`-compatible
//! logger can display them. Output is off until enabled with
//! [`InitParams::log_enabled`](crate::InitParams::log_enabled).
use std::sync::atomic::{AtomicBool, Ordering};

static ENABLED: AtomicBool = AtomicBool::new(false);

pub(crate) fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

pub(crate) fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

macro_rules! log_debug {
    ($($arg:tt)+) => {
        if $crate::logging::enabled() {
            ::log::debug!(target: "splyt", $($arg)+)
        }
    };
}

macro_rules! log_warn {
    ($($arg:tt)+) => {
        if $crate::logging::enabled() {
            ::log::warn!(target: "splyt", $($arg)+)
        }
    };
}

macro_rules! log_trace {
    ($($arg:tt)+) => {
        if $crate::logging::enabled() {
            ::log::trace!(target: "splyt", $($arg)+)
        }
    };
}

pub(crate) use {log_debug, log_trace, log_warn};
