//! Requests understood by the Splyt collector.
//!
//! Every call is a positional JSON array posted to
//! `{host}/isos-personalization/ws/interface/{endpoint}`. The first element is the client
//! timestamp in seconds. Responses are wrapped in an envelope carrying a top-level error code and
//! a per-context result:
//!
//! ```json
//! {"error": 0, "data": {"datacollector_batch": {"error": 0, "data": null}}}
//! ```
use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::{
    entity::ResolvedEntity, event::Event, logging, tuning::TuningData, Error, ErrorCode, Result,
    Transport,
};

const INTERFACE_PATH: &str = "/isos-personalization/ws/interface/";

/// Collector endpoints used by the SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endpoint {
    Batch,
    ApplicationInit,
    UpdateUser,
    TunerRefresh,
}

impl Endpoint {
    /// Path segment, also used as the context name in the response envelope.
    pub(crate) fn name(self) -> &'static str {
        match self {
            Endpoint::Batch => "datacollector_batch",
            Endpoint::ApplicationInit => "application_init",
            Endpoint::UpdateUser => "application_updateuser",
            Endpoint::TunerRefresh => "tuner_refresh",
        }
    }
}

pub(crate) struct CollectorConfig {
    pub host: String,
    pub customer_id: String,
    /// SDK name reported to the collector.
    pub sdk_name: String,
    /// Version of SDK.
    pub sdk_version: String,
    pub request_timeout: Duration,
    pub transport: Arc<dyn Transport>,
}

/// A client for the Splyt collector.
pub(crate) struct Collector {
    config: CollectorConfig,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    error: ErrorCode,
    #[serde(default)]
    data: HashMap<String, ContextResult>,
}

#[derive(Debug, Deserialize)]
struct ContextResult {
    error: ErrorCode,
    #[serde(default)]
    data: Value,
}

impl Collector {
    /// Create a collector client.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidHost`] if the host is not a valid URL.
    pub fn new(config: CollectorConfig) -> Result<Collector> {
        let collector = Collector { config };
        // Validate the host once so later requests can't fail on it.
        collector.url(Endpoint::Batch)?;
        Ok(collector)
    }

    fn url(&self, endpoint: Endpoint) -> Result<Url> {
        Url::parse_with_params(
            &format!(
                "{}{}{}",
                self.config.host.trim_end_matches('/'),
                INTERFACE_PATH,
                endpoint.name()
            ),
            &[
                ("ssf_cust_id", &*self.config.customer_id),
                ("ssf_output", "json"),
                ("ssf_sdk", &*self.config.sdk_name),
                ("ssf_sdk_version", &*self.config.sdk_version),
            ],
        )
        .map_err(Error::InvalidHost)
    }

    /// Post `args` to `endpoint` and return the data of the endpoint's context.
    fn call(&self, endpoint: Endpoint, args: Vec<Value>) -> Result<Value> {
        let url = self.url(endpoint)?;
        let timestamp = Utc::now().timestamp_millis() as f64 / 1000.0;
        let mut body = vec![json!(timestamp)];
        body.extend(args);

        logging::log_debug!(endpoint = endpoint.name(); "calling collector");
        let response = self
            .config
            .transport
            .post(&url, &Value::Array(body), self.config.request_timeout)
            .inspect_err(|err| {
                logging::log_warn!(endpoint = endpoint.name(); "collector request failed: {:?}", err);
            })?;

        parse_envelope(endpoint, response)
    }

    /// Deliver a batch of events.
    pub fn send_batch(&self, events: &[Event]) -> Result<()> {
        self.call(Endpoint::Batch, vec![serde_json::to_value(events)?])?;
        Ok(())
    }

    /// Register the device and, if known, the initial user. Returns their tuning.
    pub fn application_init(
        &self,
        device: &ResolvedEntity,
        user: Option<&ResolvedEntity>,
    ) -> Result<TuningData> {
        let data = self.call(
            Endpoint::ApplicationInit,
            vec![serde_json::to_value(device)?, serde_json::to_value(user)?],
        )?;
        parse_tuning(data)
    }

    /// Register a user seen on `device_id`. Returns the user's tuning.
    pub fn register_user(&self, device_id: &str, user: &ResolvedEntity) -> Result<TuningData> {
        let data = self.call(
            Endpoint::UpdateUser,
            vec![json!(device_id), serde_json::to_value(user)?],
        )?;
        parse_tuning(data)
    }

    /// Fetch current tuning for the device and the given users.
    pub fn refresh_tuning(&self, device_id: &str, user_ids: &[String]) -> Result<TuningData> {
        let data = self.call(Endpoint::TunerRefresh, vec![json!(device_id), json!(user_ids)])?;
        parse_tuning(data)
    }
}

fn parse_envelope(endpoint: Endpoint, response: Value) -> Result<Value> {
    let mut envelope: Envelope = serde_json::from_value(response)?;
    if envelope.error != ErrorCode::Success {
        logging::log_warn!(endpoint = endpoint.name(), error = envelope.error.value();
            "top-level error returned from collector");
        return Err(Error::Collector(envelope.error));
    }

    let Some(context) = envelope.data.remove(endpoint.name()) else {
        logging::log_warn!(endpoint = endpoint.name(); "unexpected collector response, context missing");
        return Err(Error::Collector(ErrorCode::Unknown));
    };
    if context.error != ErrorCode::Success {
        logging::log_warn!(endpoint = endpoint.name(), error = context.error.value();
            "context error returned from collector");
        return Err(Error::Collector(context.error));
    }

    Ok(context.data)
}

fn parse_tuning(data: Value) -> Result<TuningData> {
    if data.is_null() {
        return Ok(TuningData::default());
    }
    Ok(serde_json::from_value(data)?)
}


#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use serde_json::{json, Value};
    use url::Url;

    use super::{test_support::ok_response, Collector, CollectorConfig};
    use crate::{
        entity::{EntityInfo, ResolvedEntity},
        event::test_support::event,
        Error, ErrorCode, Result,
    };

    fn collector(
        transport: impl Fn(&Url, &Value, Duration) -> Result<Value> + Send + Sync + 'static,
    ) -> Collector {
        Collector::new(CollectorConfig {
            host: "https://data.splyt.com/".to_owned(),
            customer_id: "acme".to_owned(),
            sdk_name: "rust".to_owned(),
            sdk_version: "0.1.0".to_owned(),
            request_timeout: Duration::from_millis(1500),
            transport: Arc::new(transport),
        })
        .unwrap()
    }

    #[test]
    fn batch_request_is_positional_with_query_params() {
        let collector = collector(|url, body, timeout| {
            assert_eq!(
                url.as_str(),
                "https://data.splyt.com/isos-personalization/ws/interface/datacollector_batch\
                 ?ssf_cust_id=acme&ssf_output=json&ssf_sdk=rust&ssf_sdk_version=0.1.0"
            );
            assert_eq!(timeout, Duration::from_millis(1500));
            assert!(body[0].is_number());
            assert_eq!(body[1].as_array().unwrap().len(), 2);
            assert_eq!(body[1][0]["deviceId"], "device");
            Ok(ok_response("datacollector_batch", Value::Null))
        });

        collector.send_batch(&[event(1), event(2)]).unwrap();
    }

    #[test]
    fn invalid_host_is_rejected() {
        let result = Collector::new(CollectorConfig {
            host: "not a host".to_owned(),
            customer_id: "acme".to_owned(),
            sdk_name: "rust".to_owned(),
            sdk_version: "0.1.0".to_owned(),
            request_timeout: Duration::from_millis(1500),
            transport: Arc::new(|_: &Url, _: &Value, _: Duration| Ok(Value::Null)),
        });
        assert!(matches!(result, Err(Error::InvalidHost(_))));
    }

    #[test]
    fn envelope_errors_are_reported() {
        let top_level = collector(|_, _, _| Ok(json!({"error": -1, "data": {}})));
        assert!(matches!(
            top_level.send_batch(&[event(1)]),
            Err(Error::Collector(ErrorCode::Generic))
        ));

        let context = collector(|_, _, _| {
            Ok(json!({"error": 0, "data": {"datacollector_batch": {"error": -4}}}))
        });
        assert!(matches!(
            context.send_batch(&[event(1)]),
            Err(Error::Collector(ErrorCode::InvalidArgs))
        ));

        let missing = collector(|_, _, _| Ok(json!({"error": 0, "data": {}})));
        assert!(matches!(
            missing.send_batch(&[event(1)]),
            Err(Error::Collector(ErrorCode::Unknown))
        ));
    }

    #[test]
    fn transport_errors_pass_through() {
        let collector = collector(|_, _, _| Err(Error::RequestTimedOut));
        assert!(matches!(
            collector.send_batch(&[event(1)]),
            Err(Error::RequestTimedOut)
        ));
    }

    #[test]
    fn application_init_returns_tuning() {
        let collector = collector(|_, body, _| {
            assert_eq!(body[1]["type"], "device");
            assert_eq!(body[1]["isNew"], true);
            assert_eq!(body[2]["id"], "u1");
            Ok(ok_response(
                "application_init",
                json!({"deviceTuning": {"lives": 3}, "userTuning": {"u1": {"lives": 5}}}),
            ))
        });

        let device = ResolvedEntity::resolve(&EntityInfo::device(), "d1".into(), false);
        let user = ResolvedEntity::resolve(&EntityInfo::user("u1"), "u1".into(), true);
        let tuning = collector.application_init(&device, Some(&user)).unwrap();

        assert_eq!(tuning.device_tuning.unwrap()["lives"], 3);
        assert_eq!(tuning.user_tuning["u1"]["lives"], 5);
    }
}
