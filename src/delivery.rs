//! Delivery of queued events to the collector.
//!
//! [`DeliveryEngine`] performs a single flush attempt and tracks the backoff between attempts.
//! [`DeliveryThread`] calls it periodically in the background.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
        Mutex,
    },
    time::Duration,
};

use rand::{thread_rng, Rng};
use uuid::Uuid;

use crate::{collector::Collector, config::DeliveryConfig, event::Event, logging, Error, Result};

/// Result of a successful flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was queued.
    Empty,
    /// The collector accepted this many events.
    Delivered(usize),
    /// The collector received this many events but rejected them with an error code. They are
    /// removed from the queue, since re-sending them would be rejected again.
    Rejected(usize),
    /// Another flush was already in flight. Nothing was sent.
    InFlight,
}

/// Delivery period bounded between a floor and a cap.
///
/// Each failure doubles the period up to the cap; each success halves it down to the floor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Backoff {
    period: Duration,
    min: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Backoff {
        let max = max.max(min);
        Backoff {
            period: min,
            min,
            max,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn on_success(&mut self) {
        self.period = (self.period / 2).max(self.min);
    }

    pub fn on_failure(&mut self) {
        self.period = self.period.saturating_mul(2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.period = self.min;
    }
}

/// Sends batches of queued events, at most one at a time.
#[derive(Debug)]
pub(crate) struct DeliveryEngine {
    max_batch: usize,
    jitter_ratio: f64,
    in_flight: AtomicBool,
    backoff: Mutex<Backoff>,
}

/// Clears the in-flight flag when a flush finishes, even by panicking.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DeliveryEngine {
    pub fn new(config: &DeliveryConfig) -> DeliveryEngine {
        DeliveryEngine {
            max_batch: config.max_batch.max(1),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
            in_flight: AtomicBool::new(false),
            backoff: Mutex::new(Backoff::new(config.min_period, config.max_period)),
        }
    }

    /// Attempt to deliver one batch.
    ///
    /// `next_batch` is called with the maximum batch size and must return the oldest queued events
    /// without removing them. `acknowledge` is called with the ids of events that no longer need to
    /// be sent. Neither is called while another flush is in flight.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the batch could not be delivered. The batch stays queued.
    pub fn flush(
        &self,
        collector: &Collector,
        next_batch: impl FnOnce(usize) -> Vec<Event>,
        acknowledge: impl FnOnce(&[Uuid]),
    ) -> Result<FlushOutcome> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            logging::log_trace!("flush already in flight");
            return Ok(FlushOutcome::InFlight);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let batch = next_batch(self.max_batch);
        if batch.is_empty() {
            return Ok(FlushOutcome::Empty);
        }
        let ids: Vec<Uuid> = batch.iter().map(|event| event.id).collect();

        match collector.send_batch(&batch) {
            Ok(()) => {
                acknowledge(&ids);
                self.update_backoff(Backoff::on_success);
                logging::log_debug!(events = ids.len(); "delivered events");
                Ok(FlushOutcome::Delivered(ids.len()))
            }
            Err(Error::Collector(code)) => {
                acknowledge(&ids);
                self.update_backoff(Backoff::on_success);
                logging::log_warn!(events = ids.len(), error = code.value();
                    "collector rejected events, dropping them");
                Ok(FlushOutcome::Rejected(ids.len()))
            }
            Err(err) => {
                self.update_backoff(Backoff::on_failure);
                logging::log_debug!(events = ids.len(), retry_in:? = self.period();
                    "delivery failed, events stay queued");
                Err(err)
            }
        }
    }

    /// Current delivery period, before jitter.
    pub fn period(&self) -> Duration {
        self.backoff.lock().map_or(Duration::ZERO, |backoff| backoff.period())
    }

    /// Time to wait before the next periodic flush.
    pub fn next_wait(&self) -> Duration {
        let period = self.period();
        jitter(period, period.mul_f64(self.jitter_ratio))
    }

    pub fn reset_backoff(&self) {
        self.update_backoff(Backoff::reset);
    }

    fn update_backoff(&self, f: impl FnOnce(&mut Backoff)) {
        if let Ok(mut backoff) = self.backoff.lock() {
            f(&mut backoff);
        }
    }
}

/// A background thread that periodically runs a delivery tick.
///
/// The tick returns how long to wait before running again, or `None` to stop the thread.
pub(crate) struct DeliveryThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the delivery thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,
}

impl DeliveryThread {
    /// Start the delivery thread. The first tick runs after `initial_wait`.
    ///
    /// # Errors
    ///
    /// - IO error if the thread failed to start.
    pub fn start(
        initial_wait: Duration,
        mut tick: impl FnMut() -> Option<Duration> + Send + 'static,
    ) -> Result<DeliveryThread> {
        // Buffer size of 1 is enough: a stop command is only sent once, and `try_send()` can
        // ignore a full buffer.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let join_handle = std::thread::Builder::new()
            .name("splyt-delivery".to_owned())
            .spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let mut wait = initial_wait;
                    loop {
                        match stop_receiver.recv_timeout(wait) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Timed out. Time for the next tick.
                            }
                            Ok(()) => {
                                logging::log_debug!("delivery thread received stop command");
                                return;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                logging::log_debug!("delivery thread disconnected");
                                return;
                            }
                        }

                        match tick() {
                            Some(next) => wait = next,
                            None => return,
                        }
                    }
                }));
                if result.is_err() {
                    logging::log_warn!("delivery thread panicked, periodic delivery stopped");
                }
            })?;

        Ok(DeliveryThread {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the delivery thread without waiting for it to exit.
    pub fn stop(&self) {
        // Error means that the thread already exited or a stop command is already pending.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the delivery thread and block waiting for it to exit.
    ///
    /// # Errors
    ///
    /// - [`Error::DeliveryThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();
        if self.join_handle.thread().id() == std::thread::current().id() {
            // Called from a tick. The thread exits on its own once the tick returns.
            return Ok(());
        }
        self.join_handle
            .join()
            .map_err(|_| Error::DeliveryThreadPanicked)?;
        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}


#[cfg(test)]
mod jitter_tests {
    use std::time::Duration;

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::from_secs(3);

        let result = super::jitter(interval, jitter);

        assert!(result <= interval, "{result:?} must be <= {interval:?}");
        assert!(result >= interval - jitter, "{result:?} must be >= {:?}", interval - jitter);
    }

    #[test]
    fn jitter_truncates_to_zero() {
        let result = super::jitter(Duration::ZERO, Duration::from_secs(30));
        assert_eq!(result, Duration::ZERO);
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let result = super::jitter(Duration::from_secs(30), Duration::ZERO);
        assert_eq!(result, Duration::from_secs(30));
    }
}
