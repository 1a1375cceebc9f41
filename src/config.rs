use std::{path::PathBuf, sync::Arc, time::Duration};

use crate::{EntityInfo, FileStorage, Storage, Transport};

/// Parameters for [`SessionController::init`](crate::SessionController::init).
///
/// ```
/// # use splyt::{EntityInfo, InitParams};
/// let params = InitParams::new("acme-product-1")
///     .user(EntityInfo::user("u1"))
///     .log_enabled(true);
/// ```
#[derive(Clone)]
pub struct InitParams {
    pub(crate) customer_id: String,
    pub(crate) user: Option<EntityInfo>,
    pub(crate) device: EntityInfo,
    pub(crate) host: String,
    pub(crate) request_timeout: Duration,
    pub(crate) log_enabled: bool,
    pub(crate) storage: Option<Arc<dyn Storage>>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) delivery: DeliveryConfig,
    pub(crate) sdk_name: String,
    pub(crate) sdk_version: String,
}

impl InitParams {
    /// Default collector host.
    pub const DEFAULT_HOST: &'static str = "https://data.splyt.com";

    /// Default maximum time to wait for a collector request.
    pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);

    /// Create parameters for the product identified by `customer_id`, as provided by Splyt.
    pub fn new(customer_id: impl Into<String>) -> InitParams {
        InitParams {
            customer_id: customer_id.into(),
            user: None,
            device: EntityInfo::device(),
            host: InitParams::DEFAULT_HOST.to_owned(),
            request_timeout: InitParams::DEFAULT_REQUEST_TIMEOUT,
            log_enabled: false,
            storage: None,
            transport: None,
            delivery: DeliveryConfig::default(),
            sdk_name: "rust".to_owned(),
            sdk_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    /// The user to register and activate during init, if already known.
    pub fn user(mut self, user: EntityInfo) -> InitParams {
        self.user = Some(user);
        self
    }

    /// Device properties, and optionally an id overriding the generated one.
    pub fn device(mut self, device: EntityInfo) -> InitParams {
        self.device = device;
        self
    }

    /// Override the collector host. Applications should use the default in most cases.
    pub fn host(mut self, host: impl Into<String>) -> InitParams {
        self.host = host.into();
        self
    }

    /// Maximum time to wait for a single collector request.
    pub fn request_timeout(mut self, request_timeout: Duration) -> InitParams {
        self.request_timeout = request_timeout;
        self
    }

    /// Enable SDK log output through the `log` crate. Disabled by default.
    pub fn log_enabled(mut self, log_enabled: bool) -> InitParams {
        self.log_enabled = log_enabled;
        self
    }

    /// Where to persist state across pause/resume. Defaults to memory only.
    pub fn storage(mut self, storage: impl Storage + 'static) -> InitParams {
        self.storage = Some(Arc::new(storage));
        self
    }

    /// Persist state as files inside `dir`.
    pub fn storage_dir(self, dir: impl Into<PathBuf>) -> InitParams {
        self.storage(FileStorage::new(dir))
    }

    /// Send collector requests through `transport` instead of the built-in HTTP client.
    pub fn transport(mut self, transport: impl Transport + 'static) -> InitParams {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Tune background delivery.
    pub fn delivery(mut self, delivery: DeliveryConfig) -> InitParams {
        self.delivery = delivery;
        self
    }

    /// Identify a wrapping SDK to the collector.
    pub fn sdk(mut self, name: impl Into<String>, version: impl Into<String>) -> InitParams {
        self.sdk_name = name.into();
        self.sdk_version = version.into();
        self
    }
}

impl std::fmt::Debug for InitParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitParams")
            .field("customer_id", &self.customer_id)
            .field("user", &self.user)
            .field("device", &self.device)
            .field("host", &self.host)
            .field("request_timeout", &self.request_timeout)
            .field("log_enabled", &self.log_enabled)
            .field("delivery", &self.delivery)
            .field("sdk_name", &self.sdk_name)
            .field("sdk_version", &self.sdk_version)
            .finish_non_exhaustive()
    }
}

/// Configuration of event delivery.
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Delivery period after successful deliveries.
    ///
    /// Defaults to [`DeliveryConfig::DEFAULT_MIN_PERIOD`].
    pub min_period: Duration,
    /// Longest delivery period, reached after repeated failures.
    ///
    /// Defaults to [`DeliveryConfig::DEFAULT_MAX_PERIOD`].
    pub max_period: Duration,
    /// Fraction of the period randomly subtracted from every wait.
    pub jitter_ratio: f64,
    /// Maximum number of events sent in one request.
    pub max_batch: usize,
    /// Maximum number of queued events. The oldest events are dropped beyond it.
    pub queue_capacity: usize,
    /// Whether to run the background delivery thread. Without it, events are only delivered by
    /// explicit flushes and on pause.
    pub background: bool,
}

impl DeliveryConfig {
    /// Default value for [`DeliveryConfig::min_period`].
    pub const DEFAULT_MIN_PERIOD: Duration = Duration::from_secs(5);
    /// Default value for [`DeliveryConfig::max_period`].
    pub const DEFAULT_MAX_PERIOD: Duration = Duration::from_secs(30);
    /// Default value for [`DeliveryConfig::jitter_ratio`].
    pub const DEFAULT_JITTER_RATIO: f64 = 0.1;
    /// Default value for [`DeliveryConfig::max_batch`].
    pub const DEFAULT_MAX_BATCH: usize = 50;

    /// Create a `DeliveryConfig` using default configuration.
    pub fn new() -> DeliveryConfig {
        DeliveryConfig::default()
    }

    /// Update the delivery period bounds.
    pub fn with_periods(mut self, min_period: Duration, max_period: Duration) -> DeliveryConfig {
        self.min_period = min_period;
        self.max_period = max_period;
        self
    }

    /// Update the maximum batch size.
    pub fn with_max_batch(mut self, max_batch: usize) -> DeliveryConfig {
        self.max_batch = max_batch;
        self
    }

    /// Update the queue capacity.
    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> DeliveryConfig {
        self.queue_capacity = queue_capacity;
        self
    }

    /// Enable or disable the background delivery thread.
    pub fn with_background(mut self, background: bool) -> DeliveryConfig {
        self.background = background;
        self
    }
}

impl Default for DeliveryConfig {
    fn default() -> DeliveryConfig {
        DeliveryConfig {
            min_period: DeliveryConfig::DEFAULT_MIN_PERIOD,
            max_period: DeliveryConfig::DEFAULT_MAX_PERIOD,
            jitter_ratio: DeliveryConfig::DEFAULT_JITTER_RATIO,
            max_batch: DeliveryConfig::DEFAULT_MAX_BATCH,
            queue_capacity: crate::EventQueue::DEFAULT_CAPACITY,
            background: true,
        }
    }
}
