//! Network round-trip to the endpoint's origin, measured beside the probe.

use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// Upper bound for a ping regardless of the probe timeout
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// `scheme://host[:port]/` of an endpoint
pub fn origin(endpoint: &str) -> Option<String> {
    let url = Url::parse(endpoint).ok()?;
    let host = url.host_str()?;
    match url.port() {
        Some(port) => Some(format!("{}://{}:{}/", url.scheme(), host, port)),
        None => Some(format!("{}://{}/", url.scheme(), host)),
    }
}

/// HEAD the origin and report the round-trip in milliseconds.
///
/// Any HTTP answer counts, including 404 and 405; only a failure to reach
/// the host yields `None`.
pub async fn ping_endpoint(client: &reqwest::Client, endpoint: &str) -> Option<u64> {
    let origin = origin(endpoint)?;
    let started = Instant::now();
    match client.head(&origin).timeout(PING_TIMEOUT).send().await {
        Ok(_) => Some(started.elapsed().as_millis() as u64),
        Err(err) => {
            tracing::debug!(origin = %origin, error = %err, "Ping failed");
            None
        }
    }
}
