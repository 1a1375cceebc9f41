use std::sync::mpsc::{sync_channel, Receiver};

use crate::{logging, Error, Result};

/// Callback invoked exactly once when an asynchronous operation finishes.
///
/// A `Completion` that is dropped without being completed, for example because the worker
/// thread panicked, invokes its callback with [`Error::Generic`].
///
/// Any `FnOnce(Result<()>)` closure converts into a `Completion`:
///
/// ```
/// # use splyt::Completion;
/// let completion: Completion = (|result: splyt::Result<()>| {
///     println!("done: {:?}", result);
/// }).into();
/// ```
pub struct Completion {
    callback: Option<Box<dyn FnOnce(Result<()>) + Send>>,
}

impl Completion {
    /// Wrap `callback`.
    pub fn new(callback: impl FnOnce(Result<()>) + Send + 'static) -> Completion {
        Completion {
            callback: Some(Box::new(callback)),
        }
    }

    /// A completion that ignores the result.
    pub fn noop() -> Completion {
        Completion { callback: None }
    }

    /// A completion that forwards its result to the returned receiver.
    pub(crate) fn channel() -> (Completion, Receiver<Result<()>>) {
        let (sender, receiver) = sync_channel(1);
        let completion = Completion::new(move |result| {
            // The receiver is gone if the caller stopped waiting.
            let _ = sender.send(result);
        });
        (completion, receiver)
    }

    /// Invoke the callback with `result`.
    pub fn complete(mut self, result: Result<()>) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(callback) = self.callback.take() {
            logging::log_warn!("operation finished without reporting a result");
            callback(Err(Error::Generic));
        }
    }
}

impl<F> From<F> for Completion
where
    F: FnOnce(Result<()>) + Send + 'static,
{
    fn from(callback: F) -> Completion {
        Completion::new(callback)
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// Wait for the result sent to a [`Completion::channel`].
pub(crate) fn wait(receiver: Receiver<Result<()>>) -> Result<()> {
    // A closed channel means the completion was consumed without a result, which `Drop` already
    // turned into `Generic`.
    receiver.recv().unwrap_or(Err(Error::Generic))
}
