//! The session: initialization, the active user, pause/resume and delivery.
use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Instant,
};

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::{
    collector::{Collector, CollectorConfig},
    completion::{self, Completion},
    delivery::{DeliveryEngine, DeliveryThread, FlushOutcome},
    entity::{EntityInfo, EntityType, ResolvedEntity},
    event::{Event, EventBody, EventKind},
    logging,
    storage::{load_json, save_json, MemoryStorage, Storage},
    transaction_registry::TransactionRegistry,
    tuning::{TuningData, TuningStore},
    Error, EventQueue, HttpTransport, InitParams, Instrumentation, Result, Tuning,
};

/// Storage key of the persisted session state.
pub(crate) const SESSION_STATE_KEY: &str = "splyt_sessionState";

/// Initialization status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// [`SessionController::init`] has not been called.
    Uninitialized,
    /// The application registration is in flight. Instrumentation is already available.
    Initializing,
    /// Initialization finished, successfully or not.
    Ready,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedSession {
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    known_users: BTreeSet<String>,
    #[serde(default)]
    active_user: Option<String>,
}

#[derive(Debug)]
pub(crate) struct SessionState {
    status: InitStatus,
    device_id: Option<String>,
    active_user: Option<String>,
    known_users: BTreeSet<String>,
    /// Set while paused. The transaction clock is frozen at this instant.
    paused_at: Option<Instant>,
}

/// Collaborators created by `init`.
pub(crate) struct Services {
    collector: Collector,
    storage: Arc<dyn Storage>,
    delivery: DeliveryEngine,
    background: bool,
}

/// Everything guarded by the session lock.
pub(crate) struct Core {
    pub(crate) state: SessionState,
    pub(crate) registry: TransactionRegistry,
    pub(crate) queue: EventQueue,
    services: Option<Arc<Services>>,
    /// Set when the last write-through failed, so storage is older than memory.
    persist_failed: bool,
}

impl Core {
    /// Current time as seen by transactions.
    fn clock(&self) -> Instant {
        self.state.paused_at.unwrap_or_else(Instant::now)
    }

    /// Tag `body` with the device and active user and queue it.
    pub(crate) fn record(&mut self, body: EventBody) {
        let Some(device_id) = &self.state.device_id else {
            logging::log_debug!(kind:? = body.kind; "dropping event recorded before init");
            return;
        };
        let event = Event::tagged(body, device_id, self.state.active_user.as_deref());
        self.queue.enqueue(event);
    }

    fn collect_emitted(&mut self) {
        for body in self.registry.take_emitted() {
            self.record(body);
        }
    }

    pub(crate) fn require_initialized(&self) -> Result<()> {
        match self.state.status {
            InitStatus::Uninitialized => Err(Error::NotInitialized),
            InitStatus::Initializing | InitStatus::Ready => Ok(()),
        }
    }

    pub(crate) fn active_user(&self) -> Option<&str> {
        self.state.active_user.as_deref()
    }

    fn persist_session(&self, storage: &dyn Storage) -> Result<()> {
        let persisted = PersistedSession {
            device_id: self.state.device_id.clone(),
            known_users: self.state.known_users.clone(),
            active_user: self.state.active_user.clone(),
        };
        save_json(storage, SESSION_STATE_KEY, &persisted)
    }

    /// Write all state to storage. Failures are logged, the in-memory state stays authoritative.
    fn persist_all(&mut self, tuning: &TuningStore) {
        let Some(services) = &self.services else {
            return;
        };
        let storage = &*services.storage;
        let result = self
            .queue
            .persist(storage)
            .and_then(|()| self.registry.persist(storage, self.clock()))
            .and_then(|()| self.persist_session(storage))
            .and_then(|()| tuning.persist(storage));
        if let Err(err) = &result {
            logging::log_warn!("failed to persist session state: {:?}", err);
        }
        self.persist_failed = result.is_err();
    }
}

pub(crate) struct Inner {
    core: Mutex<Core>,
    tuning: Arc<TuningStore>,
    delivery_thread: Mutex<Option<DeliveryThread>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The last reference may be dropped on the delivery thread itself, so only signal it.
        if let Ok(Some(thread)) = self.delivery_thread.get_mut().map(Option::take) {
            thread.stop();
        }
    }
}

/// Entry point of the SDK.
///
/// A `SessionController` owns the state of one analytics session: the device and active user,
/// open transactions, queued events and cached tuning. Clones share the same session.
///
/// # Examples
/// ```no_run
/// # use splyt::{EntityInfo, InitParams, SessionController};
/// let session = SessionController::new();
/// session.init(InitParams::new("acme-product-1"), |result: splyt::Result<()>| {
///     if let Err(err) = result {
///         eprintln!("init failed, using cached tuning: {err}");
///     }
/// })?;
///
/// let mut tutorial = session.instrumentation().transaction_with_id("Tutorial", "step1");
/// tutorial.begin()?;
/// tutorial.update_at_progress(50);
/// tutorial.end();
/// # Ok::<(), splyt::Error>(())
/// ```
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl Default for SessionController {
    fn default() -> SessionController {
        SessionController::new()
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.lock();
        f.debug_struct("SessionController")
            .field("state", &core.state)
            .field("open_transactions", &core.registry.open_count())
            .field("queued_events", &core.queue.len())
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Create an uninitialized session.
    pub fn new() -> SessionController {
        SessionController {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    state: SessionState {
                        status: InitStatus::Uninitialized,
                        device_id: None,
                        active_user: None,
                        known_users: BTreeSet::new(),
                        paused_at: None,
                    },
                    registry: TransactionRegistry::new(),
                    queue: EventQueue::default(),
                    services: None,
                    persist_failed: false,
                }),
                tuning: Arc::new(TuningStore::new()),
                delivery_thread: Mutex::new(None),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        // A panic while holding the lock leaves the state consistent enough to keep collecting.
        self.inner
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` under the session lock.
    ///
    /// Expired transactions are swept and their timeout events queued before `f` runs, so they
    /// are attributed to the user that was active when they expired. Events emitted by `f` are
    /// queued afterwards. While paused, the resulting state is written through to storage.
    pub(crate) fn with_core<T>(&self, f: impl FnOnce(&mut Core, Instant) -> T) -> T {
        let mut core = self.lock();
        let now = core.clock();
        core.registry.sweep(now);
        core.collect_emitted();
        let result = f(&mut core, now);
        core.collect_emitted();
        if core.state.paused_at.is_some() {
            core.persist_all(&self.inner.tuning);
        }
        result
    }

    fn services(&self) -> Option<Arc<Services>> {
        self.lock().services.clone()
    }

    /// Initialize the session.
    ///
    /// Restores persisted state, establishes the device id and activates the initial user if one
    /// was given. Instrumentation is usable as soon as this returns. The application registration
    /// and the initial tuning download happen in the background; `completion` is invoked once
    /// they finish. If registration fails, the session still becomes ready using cached tuning and
    /// the registration is retried through the event queue.
    ///
    /// # Errors
    ///
    /// Errors are returned and also passed to `completion`.
    ///
    /// - [`Error::AlreadyInitialized`] if called more than once.
    /// - [`Error::InvalidArgs`] if the customer id is empty or the device description is not a
    ///   device.
    /// - [`Error::InvalidHost`] if the host is not a valid URL.
    pub fn init(&self, params: InitParams, completion: impl Into<Completion>) -> Result<()> {
        let completion = completion.into();
        match self.start_init(params) {
            Ok((device, user)) => {
                let session = self.clone();
                spawn_worker("splyt-init", completion, move || {
                    session.finish_init(&device, user.as_ref())
                })
            }
            Err(err) => {
                completion.complete(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Initialize the session and block until initialization finishes. See [`SessionController::init`].
    pub fn init_blocking(&self, params: InitParams) -> Result<()> {
        let (completion, receiver) = Completion::channel();
        self.init(params, completion)?;
        completion::wait(receiver)
    }

    fn start_init(&self, params: InitParams) -> Result<(ResolvedEntity, Option<ResolvedEntity>)> {
        let mut core = self.lock();
        if core.state.status != InitStatus::Uninitialized {
            return Err(Error::AlreadyInitialized);
        }

        logging::set_enabled(params.log_enabled);

        if params.customer_id.is_empty() {
            return Err(Error::InvalidArgs("customer id must not be empty"));
        }
        if params.device.entity_type() != EntityType::Device {
            return Err(Error::InvalidArgs("device description must be a device"));
        }
        if let Some(user) = &params.user {
            if user.entity_type() != EntityType::User {
                return Err(Error::InvalidArgs("user description must be a user"));
            }
        }

        let collector = Collector::new(CollectorConfig {
            host: params.host.clone(),
            customer_id: params.customer_id.clone(),
            sdk_name: params.sdk_name.clone(),
            sdk_version: params.sdk_version.clone(),
            request_timeout: params.request_timeout,
            transport: params
                .transport
                .clone()
                .unwrap_or_else(|| Arc::new(HttpTransport::new())),
        })?;
        let storage = params
            .storage
            .clone()
            .unwrap_or_else(|| Arc::new(MemoryStorage::new()));

        let now = Instant::now();
        core.queue = EventQueue::new(params.delivery.queue_capacity);
        restore_or_warn("event queue", core.queue.restore(&*storage));
        restore_or_warn("transactions", core.registry.restore(&*storage, now));
        restore_or_warn("tuning", self.inner.tuning.restore(&*storage));
        let persisted = match load_json::<PersistedSession>(&*storage, SESSION_STATE_KEY) {
            Ok(persisted) => persisted.unwrap_or_default(),
            Err(err) => {
                logging::log_warn!("failed to restore session state: {:?}", err);
                PersistedSession::default()
            }
        };

        let device_id = params
            .device
            .id()
            .map(str::to_owned)
            .or_else(|| persisted.device_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let device_seen = persisted.device_id.as_deref() == Some(device_id.as_str());
        let device = ResolvedEntity::resolve(&params.device, device_id.clone(), device_seen);

        core.state.known_users = persisted.known_users;
        core.state.active_user = persisted.active_user;
        let user = match params.user.as_ref().and_then(|info| info.id().map(|id| (info, id))) {
            Some((info, user_id)) => {
                let seen = !core.state.known_users.insert(user_id.to_owned());
                core.state.active_user = Some(user_id.to_owned());
                Some(ResolvedEntity::resolve(info, user_id.to_owned(), seen))
            }
            None => None,
        };

        core.state.device_id = Some(device_id);
        core.state.status = InitStatus::Initializing;
        core.services = Some(Arc::new(Services {
            collector,
            delivery: DeliveryEngine::new(&params.delivery),
            storage: storage.clone(),
            background: params.delivery.background,
        }));
        self.inner.tuning.set_active_user(core.state.active_user.clone());
        if let Err(err) = core.persist_session(&*storage) {
            logging::log_warn!("failed to persist session state: {:?}", err);
        }

        logging::log_debug!(
            device_id = device.id.as_str(),
            device_is_new = device.is_new,
            user_id:? = core.active_user();
            "initializing session");
        Ok((device, user))
    }

    fn finish_init(&self, device: &ResolvedEntity, user: Option<&ResolvedEntity>) -> Result<()> {
        let result = match self.services() {
            Some(services) => services.collector.application_init(device, user),
            None => Err(Error::NotInitialized),
        };

        self.with_core(|core, _| {
            match &result {
                Ok(tuning) => self.apply_tuning(core, tuning.clone()),
                Err(err) => {
                    logging::log_warn!("application registration failed, will retry: {:?}", err);
                    core.record(EventBody::new(
                        EventKind::EntityRegistration,
                        [
                            ("device".to_owned(), json!(device)),
                            ("user".to_owned(), json!(user)),
                        ]
                        .into(),
                    ));
                }
            }
            core.state.status = InitStatus::Ready;
        });
        self.start_delivery_thread();

        logging::log_debug!(success = result.is_ok(); "session ready");
        result.map(|_| ())
    }

    fn apply_tuning(&self, core: &Core, tuning: TuningData) {
        self.inner.tuning.apply(tuning);
        if let Some(services) = &core.services {
            if let Err(err) = self.inner.tuning.persist(&*services.storage) {
                logging::log_warn!("failed to persist tuning: {:?}", err);
            }
        }
    }

    /// Register a user and make them the active user.
    ///
    /// The user's tuning is downloaded in the background; `completion` is invoked once it
    /// finishes.
    ///
    /// # Errors
    ///
    /// Errors are returned and also passed to `completion`. Nothing is recorded on error.
    ///
    /// - [`Error::NotInitialized`] unless initialization has finished.
    /// - [`Error::MissingId`] if the user has no id.
    /// - [`Error::InvalidArgs`] if `user` does not describe a user.
    pub fn register_user(&self, user: EntityInfo, completion: impl Into<Completion>) -> Result<()> {
        let completion = completion.into();
        match self.start_register_user(&user) {
            Ok((services, device_id, resolved)) => {
                let session = self.clone();
                spawn_worker("splyt-register-user", completion, move || {
                    let result = services.collector.register_user(&device_id, &resolved);
                    session.with_core(|core, _| match &result {
                        Ok(tuning) => session.apply_tuning(core, tuning.clone()),
                        Err(err) => {
                            logging::log_warn!(user_id = resolved.id.as_str();
                                "user registration failed, will retry: {:?}", err);
                            core.record(EventBody::new(
                                EventKind::EntityRegistration,
                                [("user".to_owned(), json!(resolved))].into(),
                            ));
                        }
                    });
                    result.map(|_| ())
                })
            }
            Err(err) => {
                completion.complete(Err(err.clone()));
                Err(err)
            }
        }
    }

    /// Register a user and block until their tuning is downloaded. See
    /// [`SessionController::register_user`].
    pub fn register_user_blocking(&self, user: EntityInfo) -> Result<()> {
        let (completion, receiver) = Completion::channel();
        self.register_user(user, completion)?;
        completion::wait(receiver)
    }

    fn start_register_user(
        &self,
        user: &EntityInfo,
    ) -> Result<(Arc<Services>, String, ResolvedEntity)> {
        self.with_core(|core, _| {
            let (InitStatus::Ready, Some(services), Some(device_id)) = (
                core.state.status,
                core.services.clone(),
                core.state.device_id.clone(),
            ) else {
                return Err(Error::NotInitialized);
            };
            if user.entity_type() != EntityType::User {
                return Err(Error::InvalidArgs("registered entity must be a user"));
            }
            let user_id = user.id().ok_or(Error::MissingId)?.to_owned();

            let seen = !core.state.known_users.insert(user_id.clone());
            core.state.active_user = Some(user_id.clone());
            self.inner.tuning.set_active_user(Some(user_id.clone()));
            logging::log_debug!(user_id = user_id.as_str(), is_new = !seen; "registering user");

            let resolved = ResolvedEntity::resolve(user, user_id, seen);
            Ok((services, device_id, resolved))
        })
    }

    /// Make a previously registered user the active user.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if called before [`SessionController::init`].
    /// - [`Error::MissingId`] if `user_id` is empty.
    pub fn set_active_user(&self, user_id: &str) -> Result<()> {
        self.with_core(|core, _| {
            core.require_initialized()?;
            if user_id.is_empty() {
                return Err(Error::MissingId);
            }
            if !core.state.known_users.contains(user_id) {
                logging::log_debug!(user_id; "activating a user that was never registered");
            }
            core.state.active_user = Some(user_id.to_owned());
            self.inner.tuning.set_active_user(Some(user_id.to_owned()));
            Ok(())
        })
    }

    /// Clear the active user. Subsequent events are only attributed to the device.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if called before [`SessionController::init`].
    pub fn clear_active_user(&self) -> Result<()> {
        self.with_core(|core, _| {
            core.require_initialized()?;
            core.state.active_user = None;
            self.inner.tuning.set_active_user(None);
            Ok(())
        })
    }

    /// Deliver one batch of queued events now.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if called before [`SessionController::init`].
    /// - [`Error::RequestTimedOut`] or another transport error if delivery failed. The events stay
    ///   queued.
    pub fn flush(&self) -> Result<FlushOutcome> {
        let services = self.services().ok_or(Error::NotInitialized)?;
        services.delivery.flush(
            &services.collector,
            |max_batch| self.with_core(|core, _| core.queue.drain(max_batch)),
            |ids| {
                self.with_core(|core, _| {
                    core.queue.acknowledge(ids);
                });
            },
        )
    }

    /// Flush in the background and invoke `completion` once done. See [`SessionController::flush`].
    pub fn flush_and_then(&self, completion: impl Into<Completion>) -> Result<()> {
        let session = self.clone();
        spawn_worker("splyt-flush", completion.into(), move || {
            session.flush().map(|_| ())
        })
    }

    /// Download current tuning for the device and all registered users.
    ///
    /// # Errors
    ///
    /// Errors are returned and also passed to `completion`.
    ///
    /// - [`Error::NotInitialized`] unless initialization has finished.
    pub fn refresh(&self, completion: impl Into<Completion>) -> Result<()> {
        let completion = completion.into();
        let started = self.with_core(|core, _| {
            match (core.state.status, &core.services, &core.state.device_id) {
                (InitStatus::Ready, Some(services), Some(device_id)) => Ok((
                    services.clone(),
                    device_id.clone(),
                    core.state.known_users.iter().cloned().collect::<Vec<_>>(),
                )),
                _ => Err(Error::NotInitialized),
            }
        });
        let (services, device_id, user_ids) = match started {
            Ok(started) => started,
            Err(err) => {
                completion.complete(Err(err.clone()));
                return Err(err);
            }
        };

        let session = self.clone();
        spawn_worker("splyt-refresh", completion, move || {
            let result = services.collector.refresh_tuning(&device_id, &user_ids);
            session.with_core(|core, _| match &result {
                Ok(tuning) => session.apply_tuning(core, tuning.clone()),
                Err(err) => {
                    logging::log_warn!("tuning refresh failed, will retry: {:?}", err);
                    core.record(EventBody::new(
                        EventKind::TuningRefresh,
                        [("userIds".to_owned(), json!(user_ids))].into(),
                    ));
                }
            });
            result.map(|_| ())
        })
    }

    /// Download current tuning and block until done. See [`SessionController::refresh`].
    pub fn refresh_blocking(&self) -> Result<()> {
        let (completion, receiver) = Completion::channel();
        self.refresh(completion)?;
        completion::wait(receiver)
    }

    /// Suspend the session, for example when the application moves to the background.
    ///
    /// Queued events are flushed on a best-effort basis, all state is persisted and periodic
    /// delivery stops. Transaction timeouts do not advance while paused. Calls made while paused
    /// are persisted immediately.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if called before [`SessionController::init`].
    pub fn pause(&self) -> Result<()> {
        self.with_core(|core, _| core.require_initialized())?;
        if self.is_paused() {
            return Ok(());
        }

        if let Err(err) = self.flush() {
            logging::log_debug!("flush on pause failed, events stay queued: {:?}", err);
        }

        self.with_core(|core, now| {
            core.state.paused_at = Some(now);
        });
        self.stop_delivery_thread()?;
        logging::log_debug!("session paused");
        Ok(())
    }

    /// Resume a paused session: restore persisted state and restart periodic delivery.
    ///
    /// If a write made while paused could not be persisted, the in-memory state is kept instead.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`] if called before [`SessionController::init`].
    pub fn resume(&self) -> Result<()> {
        {
            let mut core = self.lock();
            core.require_initialized()?;
            let (Some(paused_at), Some(services)) = (core.state.paused_at, core.services.clone())
            else {
                return Ok(());
            };

            let now = Instant::now();
            if core.persist_failed {
                // Storage missed writes made while paused. Keep memory and only restart the clock.
                logging::log_warn!("resuming from memory, persisted state is stale");
                core.registry.extend_deadlines(now.saturating_duration_since(paused_at));
            } else {
                let storage = &*services.storage;
                restore_or_warn("event queue", core.queue.restore(storage));
                restore_or_warn("transactions", core.registry.restore(storage, now));
            }
            core.state.paused_at = None;
            services.delivery.reset_backoff();
        }

        self.start_delivery_thread();
        logging::log_debug!("session resumed");
        Ok(())
    }

    /// Stop periodic delivery and persist all state. The session stays usable.
    ///
    /// # Errors
    ///
    /// - [`Error::DeliveryThreadPanicked`] if the delivery thread panicked.
    pub fn shutdown(&self) -> Result<()> {
        let stopped = self.stop_delivery_thread();
        self.lock().persist_all(&self.inner.tuning);
        stopped
    }

    fn start_delivery_thread(&self) {
        let Some(services) = self.services() else {
            return;
        };
        if !services.background || self.is_paused() {
            return;
        }
        let mut slot = self
            .inner
            .delivery_thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }

        let session = Arc::downgrade(&self.inner);
        match DeliveryThread::start(services.delivery.next_wait(), move || {
            delivery_tick(&session)
        }) {
            Ok(thread) => *slot = Some(thread),
            Err(err) => logging::log_warn!("failed to start delivery thread: {:?}", err),
        }
    }

    fn stop_delivery_thread(&self) -> Result<()> {
        let thread = self
            .inner
            .delivery_thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match thread {
            Some(thread) => thread.shutdown(),
            None => Ok(()),
        }
    }

    /// Application facing instrumentation: transactions and state updates.
    pub fn instrumentation(&self) -> Instrumentation {
        Instrumentation::new(self.clone())
    }

    /// Read access to tuning variables.
    pub fn tuning(&self) -> Tuning {
        Tuning::new(self.inner.tuning.clone())
    }

    /// Id of the active user.
    pub fn user_id(&self) -> Option<String> {
        self.lock().state.active_user.clone()
    }

    /// Id of the device, once initialized.
    pub fn device_id(&self) -> Option<String> {
        self.lock().state.device_id.clone()
    }

    /// Initialization status.
    pub fn status(&self) -> InitStatus {
        self.lock().state.status
    }

    /// Whether the session is paused.
    pub fn is_paused(&self) -> bool {
        self.lock().state.paused_at.is_some()
    }

    /// Number of events waiting to be delivered.
    pub fn queued_event_count(&self) -> usize {
        self.lock().queue.len()
    }
}

/// One run of the background delivery thread: sweep timeouts, then flush until the queue is empty
/// or delivery fails.
fn delivery_tick(session: &Weak<Inner>) -> Option<std::time::Duration> {
    let session = SessionController {
        inner: session.upgrade()?,
    };
    let services = session.services()?;
    if session.is_paused() {
        return None;
    }

    loop {
        match session.flush() {
            Ok(FlushOutcome::Delivered(_) | FlushOutcome::Rejected(_)) => {}
            Ok(FlushOutcome::Empty | FlushOutcome::InFlight) => break,
            Err(err) => {
                logging::log_debug!("periodic delivery failed: {:?}", err);
                break;
            }
        }
    }
    Some(services.delivery.next_wait())
}

fn restore_or_warn(what: &str, result: Result<bool>) {
    if let Err(err) = result {
        logging::log_warn!(what; "failed to restore persisted state: {:?}", err);
    }
}

/// Run `work` on a new thread and pass its result to `completion`.
///
/// # Errors
///
/// - IO error if the thread failed to start. `completion` receives [`Error::Generic`].
fn spawn_worker(
    name: &str,
    completion: Completion,
    work: impl FnOnce() -> Result<()> + Send + 'static,
) -> Result<()> {
    std::thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            // If `work` panics, dropping `completion` reports a generic error.
            let result = work();
            completion.complete(result);
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc, Mutex,
        },
        time::Duration,
    };

    use serde_json::{json, Value};
    use url::Url;

    use super::{InitStatus, SessionController};
    use crate::{
        collector::{
            test_support::{endpoint_of, ok_response, RecordingTransport},
            Endpoint,
        },
        completion::{self, Completion},
        config::DeliveryConfig,
        event::EventKind,
        storage::MemoryStorage,
        EntityInfo, Error, EventQueue, FlushOutcome, InitParams, Result, Storage,
        TransactionState, Transport,
    };

    /// Memory storage whose writes can be made to fail.
    #[derive(Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        failing: AtomicBool,
    }

    impl Storage for FlakyStorage {
        fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.load(key)
        }

        fn save(&self, key: &str, data: &[u8]) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full").into());
            }
            self.inner.save(key, data)
        }

        fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key)
        }
    }

    fn params(transport: &Arc<RecordingTransport>) -> InitParams {
        let transport = transport.clone();
        InitParams::new("acme")
            .transport(move |url: &Url, body: &Value, timeout: Duration| {
                transport.post(url, body, timeout)
            })
            .delivery(DeliveryConfig::default().with_background(false))
    }

    /// Answers registrations but never delivers batches.
    fn offline_batches() -> impl Fn(&Url, &Value, Duration) -> Result<Value> + Send + Sync {
        |url: &Url, _: &Value, _: Duration| {
            let endpoint = endpoint_of(url);
            if endpoint == "datacollector_batch" {
                return Err(Error::RequestTimedOut);
            }
            Ok(ok_response(&endpoint, Value::Null))
        }
    }

    fn event_kinds(session: &SessionController) -> Vec<EventKind> {
        session.with_core(|core, _| core.queue.iter().map(|e| e.kind).collect())
    }

    #[test]
    fn scenario_init_register_and_tutorial() {
        let _ = env_logger::builder().is_test(true).try_init();
        let transport = RecordingTransport::new();
        let session = SessionController::new();

        session.init_blocking(params(&transport).log_enabled(true)).unwrap();
        assert_eq!(session.status(), InitStatus::Ready);
        session.register_user_blocking(EntityInfo::user("u1")).unwrap();

        let mut tutorial = session
            .instrumentation()
            .transaction_with_id("Tutorial", "step1");
        tutorial.begin().unwrap();
        assert_eq!(tutorial.update_at_progress(50), Some(TransactionState::Open));
        assert_eq!(tutorial.end(), Some(TransactionState::Closed));

        assert_eq!(
            event_kinds(&session),
            [
                EventKind::TransactionBegin,
                EventKind::TransactionUpdate,
                EventKind::TransactionEnd
            ]
        );
        let device_id = session.device_id().unwrap();
        session.with_core(|core, _| {
            for event in core.queue.iter() {
                assert_eq!(event.device_id, device_id);
                assert_eq!(event.user_id.as_deref(), Some("u1"));
            }
        });

        assert_eq!(session.flush().unwrap(), FlushOutcome::Delivered(3));
        let batches = transport.calls_to(Endpoint::Batch);
        let sent: Vec<&str> = batches[0][1]
            .as_array()
            .unwrap()
            .iter()
            .map(|event| event["kind"].as_str().unwrap())
            .collect();
        assert_eq!(sent, ["transaction_begin", "transaction_update", "transaction_end"]);
        assert_eq!(session.queued_event_count(), 0);
    }

    #[test]
    fn register_user_before_init_is_rejected() {
        let session = SessionController::new();
        let reported = Arc::new(Mutex::new(None));

        let result = {
            let reported = reported.clone();
            session.register_user(EntityInfo::user("u1"), move |result: Result<()>| {
                *reported.lock().unwrap() = Some(result.map_err(|err| err.code()));
            })
        };

        assert!(matches!(result, Err(Error::NotInitialized)));
        assert_eq!(
            *reported.lock().unwrap(),
            Some(Err(crate::ErrorCode::NotInitialized))
        );
        assert_eq!(session.queued_event_count(), 0);
    }

    #[test]
    fn active_user_requires_id_and_init() {
        let session = SessionController::new();
        assert!(matches!(session.set_active_user("u1"), Err(Error::NotInitialized)));
        assert!(matches!(session.clear_active_user(), Err(Error::NotInitialized)));

        session.init_blocking(params(&RecordingTransport::new())).unwrap();
        assert!(matches!(session.set_active_user(""), Err(Error::MissingId)));
        session.set_active_user("u2").unwrap();
        assert_eq!(session.user_id().as_deref(), Some("u2"));
        session.clear_active_user().unwrap();
        assert_eq!(session.user_id(), None);
    }

    #[test]
    fn second_init_is_rejected() {
        let transport = RecordingTransport::new();
        let session = SessionController::new();
        session.init_blocking(params(&transport)).unwrap();
        assert!(matches!(
            session.init_blocking(params(&transport)),
            Err(Error::AlreadyInitialized)
        ));
    }

    #[test]
    fn second_init_is_rejected_before_validation() {
        let transport = RecordingTransport::new();
        let session = SessionController::new();
        session.init_blocking(params(&transport)).unwrap();

        let empty_customer = InitParams::new("").transport(|_: &Url, _: &Value, _: Duration| {
            Err::<Value, _>(Error::Generic)
        });
        assert!(matches!(
            session.init_blocking(empty_customer),
            Err(Error::AlreadyInitialized)
        ));
        assert!(matches!(
            session.init_blocking(params(&transport).host("no host")),
            Err(Error::AlreadyInitialized)
        ));
        assert_eq!(transport.calls_to(Endpoint::ApplicationInit).len(), 1);
    }

    #[test]
    fn register_user_requires_an_id() {
        let session = SessionController::new();
        session.init_blocking(params(&RecordingTransport::new())).unwrap();

        assert!(matches!(
            session.register_user_blocking(EntityInfo::user("")),
            Err(Error::MissingId)
        ));
        assert_eq!(session.user_id(), None);
        assert_eq!(session.queued_event_count(), 0);
    }

    #[test]
    fn register_user_while_initializing_is_rejected() {
        let (release, released) = mpsc::channel::<()>();
        let released = Mutex::new(released);
        let session = SessionController::new();
        let (init_done, init_result) = Completion::channel();
        session
            .init(
                InitParams::new("acme")
                    .transport(move |url: &Url, _: &Value, _: Duration| {
                        let endpoint = endpoint_of(url);
                        if endpoint == "application_init" {
                            let _ = released.lock().unwrap().recv();
                        }
                        Ok(ok_response(&endpoint, Value::Null))
                    })
                    .delivery(DeliveryConfig::default().with_background(false)),
                init_done,
            )
            .unwrap();

        assert_eq!(session.status(), InitStatus::Initializing);
        assert!(matches!(
            session.register_user(EntityInfo::user("u1"), Completion::noop()),
            Err(Error::NotInitialized)
        ));
        assert!(matches!(session.refresh(Completion::noop()), Err(Error::NotInitialized)));

        release.send(()).unwrap();
        completion::wait(init_result).unwrap();
        assert_eq!(session.status(), InitStatus::Ready);
        session.register_user_blocking(EntityInfo::user("u1")).unwrap();
    }

    #[test]
    fn refresh_downloads_tuning_for_known_users() {
        let transport = RecordingTransport::new();
        let session = SessionController::new();
        assert!(matches!(session.refresh_blocking(), Err(Error::NotInitialized)));

        session
            .init_blocking(params(&transport).user(EntityInfo::user("u1")))
            .unwrap();
        assert_eq!(session.tuning().get_var("lives", 0), 0);

        *transport.tuning.lock().unwrap() = json!({"userTuning": {"u1": {"lives": 9}}});
        session.refresh_blocking().unwrap();

        let refresh = &transport.calls_to(Endpoint::TunerRefresh)[0];
        assert_eq!(refresh[1], json!(session.device_id().unwrap()));
        assert_eq!(refresh[2], json!(["u1"]));
        assert_eq!(session.tuning().get_var("lives", 0), 9);
        assert_eq!(session.queued_event_count(), 0);
    }

    #[test]
    fn failed_refresh_is_queued_for_retry() {
        let session = SessionController::new();
        session
            .init_blocking(
                InitParams::new("acme")
                    .transport(|url: &Url, _: &Value, _: Duration| {
                        let endpoint = endpoint_of(url);
                        if endpoint == "tuner_refresh" {
                            return Err(Error::RequestTimedOut);
                        }
                        Ok(ok_response(&endpoint, Value::Null))
                    })
                    .delivery(DeliveryConfig::default().with_background(false)),
            )
            .unwrap();

        assert!(matches!(session.refresh_blocking(), Err(Error::RequestTimedOut)));
        assert_eq!(event_kinds(&session), [EventKind::TuningRefresh]);
    }

    #[test]
    fn flush_and_then_reports_delivery() {
        let transport = RecordingTransport::new();
        let session = SessionController::new();
        assert!(matches!(session.flush(), Err(Error::NotInitialized)));
        session.init_blocking(params(&transport)).unwrap();
        session
            .instrumentation()
            .transaction("Click")
            .begin_and_end()
            .unwrap();

        let (completion, result) = Completion::channel();
        session.flush_and_then(completion).unwrap();
        completion::wait(result).unwrap();

        assert_eq!(session.queued_event_count(), 0);
        assert_eq!(transport.calls_to(Endpoint::Batch).len(), 1);
    }

    #[test]
    fn timeout_is_attributed_to_the_user_active_when_it_expired() {
        let session = SessionController::new();
        session
            .init_blocking(params(&RecordingTransport::new()).user(EntityInfo::user("u1")))
            .unwrap();

        let mut level = session.instrumentation().transaction("Level");
        level.begin_with_timeout(Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        session.set_active_user("u2").unwrap();

        session.with_core(|core, _| {
            let timeout = core.queue.iter().last().unwrap();
            assert_eq!(timeout.payload["result"], "timeout");
            assert_eq!(timeout.user_id.as_deref(), Some("u1"));
        });
    }

    #[test]
    fn invalid_params_are_rejected_without_network() {
        let transport = RecordingTransport::new();
        let session = SessionController::new();

        let empty = InitParams::new("").transport(|_: &Url, _: &Value, _: Duration| {
            Err::<Value, _>(Error::Generic)
        });
        assert!(matches!(session.init_blocking(empty), Err(Error::InvalidArgs(_))));
        assert!(matches!(
            session.init_blocking(params(&transport).host("no host")),
            Err(Error::InvalidHost(_))
        ));
        assert_eq!(session.status(), InitStatus::Uninitialized);
        assert!(transport.requests.lock().unwrap().is_empty());
    }

    #[test]
    fn init_user_and_tuning_are_active_after_init() {
        let transport = RecordingTransport::new();
        *transport.tuning.lock().unwrap() =
            json!({"deviceTuning": {"lives": 3}, "userTuning": {"u1": {"lives": 5}}});
        let session = SessionController::new();

        session
            .init_blocking(params(&transport).user(EntityInfo::user("u1")))
            .unwrap();

        assert_eq!(session.user_id().as_deref(), Some("u1"));
        assert_eq!(session.tuning().get_var("lives", 0), 5);
        session.clear_active_user().unwrap();
        assert_eq!(session.tuning().get_var("lives", 0), 3);

        let init = &transport.calls_to(Endpoint::ApplicationInit)[0];
        assert_eq!(init[1]["isNew"], true);
        assert_eq!(init[2]["id"], "u1");
    }

    #[test]
    fn failed_registration_is_queued_for_retry() {
        let session = SessionController::new();
        let result = session.init_blocking(
            InitParams::new("acme")
                .transport(|_: &Url, _: &Value, _: Duration| Err::<Value, _>(Error::RequestTimedOut))
                .delivery(DeliveryConfig::default().with_background(false)),
        );

        assert!(matches!(result, Err(Error::RequestTimedOut)));
        assert_eq!(session.status(), InitStatus::Ready);
        assert_eq!(event_kinds(&session), [EventKind::EntityRegistration]);
        assert!(matches!(session.flush(), Err(Error::RequestTimedOut)));
        assert_eq!(session.queued_event_count(), 1);
    }

    #[test]
    fn timed_out_transaction_emits_one_timeout() {
        let session = SessionController::new();
        session.init_blocking(params(&RecordingTransport::new())).unwrap();

        let mut level = session.instrumentation().transaction("Level");
        level.begin_with_timeout(Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(level.update_at_progress(10), Some(TransactionState::TimedOut));
        assert_eq!(level.end(), Some(TransactionState::TimedOut));
        assert_eq!(
            event_kinds(&session),
            [EventKind::TransactionBegin, EventKind::TransactionEnd]
        );
        session.with_core(|core, _| {
            let end = core.queue.iter().last().unwrap();
            assert_eq!(end.payload["result"], "timeout");
        });
    }

    #[test]
    fn paused_writes_go_through_to_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let session = SessionController::new();
        session
            .init_blocking(
                InitParams::new("acme")
                    .transport(offline_batches())
                    .storage(storage.clone())
                    .delivery(DeliveryConfig::default().with_background(false)),
            )
            .unwrap();

        let mut level = session.instrumentation().transaction("Level");
        level.begin().unwrap();
        session.pause().unwrap();
        assert!(session.is_paused());

        level.end();
        let mut persisted = EventQueue::default();
        assert!(persisted.restore(&storage).unwrap());
        assert_eq!(persisted.len(), 2);

        session.resume().unwrap();
        assert!(!session.is_paused());
        assert_eq!(session.queued_event_count(), 2);
    }

    #[test]
    fn resume_keeps_memory_when_paused_writes_failed() {
        let storage = Arc::new(FlakyStorage::default());
        let session = SessionController::new();
        session
            .init_blocking(
                InitParams::new("acme")
                    .transport(offline_batches())
                    .storage(storage.clone())
                    .delivery(DeliveryConfig::default().with_background(false)),
            )
            .unwrap();

        let mut level = session.instrumentation().transaction("Level");
        level.begin().unwrap();
        session.pause().unwrap();

        storage.failing.store(true, Ordering::SeqCst);
        assert_eq!(level.end(), Some(TransactionState::Closed));
        storage.failing.store(false, Ordering::SeqCst);

        session.resume().unwrap();
        assert_eq!(
            event_kinds(&session),
            [EventKind::TransactionBegin, EventKind::TransactionEnd]
        );
        assert_eq!(level.state(), Some(TransactionState::Closed));
        session.with_core(|core, _| assert_eq!(core.registry.open_count(), 0));
    }

    #[test]
    fn state_survives_restart() {
        let storage = Arc::new(MemoryStorage::new());
        let init = |session: &SessionController| {
            session.init_blocking(
                InitParams::new("acme")
                    .transport(offline_batches())
                    .storage(storage.clone())
                    .delivery(DeliveryConfig::default().with_background(false)),
            )
        };

        let first = SessionController::new();
        init(&first).unwrap();
        let mut level = first.instrumentation().transaction_with_id("Level", "1");
        level.begin().unwrap();
        first.pause().unwrap();
        let device_id = first.device_id();

        let second = SessionController::new();
        init(&second).unwrap();
        assert_eq!(second.device_id(), device_id);
        assert_eq!(second.queued_event_count(), 1);
        second.with_core(|core, _| assert_eq!(core.registry.open_count(), 1));
    }

    #[test]
    fn background_thread_delivers_queued_events() {
        let transport = RecordingTransport::new();
        let session = SessionController::new();
        session
            .init_blocking(params(&transport).delivery(
                DeliveryConfig::default().with_periods(Duration::from_millis(5), Duration::from_millis(10)),
            ))
            .unwrap();

        session
            .instrumentation()
            .transaction("Click")
            .begin_and_end()
            .unwrap();

        for _ in 0..200 {
            if session.queued_event_count() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(session.queued_event_count(), 0);
        session.shutdown().unwrap();
    }
}
