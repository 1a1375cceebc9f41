//! Sending requests to the Splyt collector.
use std::time::Duration;

use url::Url;

use crate::{logging, Result};

/// Posts a JSON body to the collector and returns the decoded JSON response.
///
/// The SDK ships with [`HttpTransport`]. Applications can provide their own implementation to
/// route requests through a platform HTTP stack, and tests use closures:
///
/// ```
/// # use splyt::{Error, Transport};
/// let offline = |_url: &url::Url, _body: &serde_json::Value, _timeout: std::time::Duration| {
///     Err::<serde_json::Value, _>(Error::RequestTimedOut)
/// };
/// # fn is_transport(_: &impl Transport) {}
/// # is_transport(&offline);
/// ```
pub trait Transport: Send + Sync {
    /// Send `body` to `url`, failing with [`Error::RequestTimedOut`](crate::Error::RequestTimedOut)
    /// if no response arrives within `timeout`.
    fn post(&self, url: &Url, body: &serde_json::Value, timeout: Duration) -> Result<serde_json::Value>;
}

impl<T> Transport for T
where
    T: Fn(&Url, &serde_json::Value, Duration) -> Result<serde_json::Value> + Send + Sync,
{
    fn post(&self, url: &Url, body: &serde_json::Value, timeout: Duration) -> Result<serde_json::Value> {
        self(url, body, timeout)
    }
}

/// [`Transport`] over HTTPS using a blocking `reqwest` client.
#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Create a transport with a fresh connection pool.
    pub fn new() -> HttpTransport {
        HttpTransport {
            client: reqwest::blocking::Client::new(),
        }
    }
}

impl Transport for HttpTransport {
    fn post(&self, url: &Url, body: &serde_json::Value, timeout: Duration) -> Result<serde_json::Value> {
        logging::log_trace!(path = url.path(); "sending collector request");
        let response = self
            .client
            .post(url.clone())
            .timeout(timeout)
            .header("ssf-use-positional-post-params", "true")
            .header("ssf-contents-not-url-encoded", "true")
            .json(body)
            .send()?;

        let response = response.error_for_status().map_err(|err| {
            logging::log_warn!(status:? = err.status();
                "received non-200 response from collector");
            err
        })?;

        Ok(response.json()?)
    }
}
