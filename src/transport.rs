//! Single-shot HTTP delivery to the sidecar

use std::time::Duration;

use crate::error::EmitError;

/// What the sidecar answered, when an answer was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub status: u16,
}

impl Delivery {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends one serialized record to an endpoint.
///
/// Implementations block the calling thread and must not retry.
pub trait Transport: Send + Sync {
    fn send(&self, url: &str, body: &[u8]) -> Result<Delivery, EmitError>;
}

/// POSTs with ureq over a fresh, non-pooled connection
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    /// `release_timeout` bounds each stage after connecting: writing the request
    /// head, writing the body and waiting for the response head. `None` leaves
    /// them unbounded.
    pub fn new(connect_timeout: Duration, release_timeout: Option<Duration>) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_connect(Some(connect_timeout))
            .timeout_send_request(release_timeout)
            .timeout_send_body(release_timeout)
            .timeout_recv_response(release_timeout)
            .http_status_as_error(false)
            .max_idle_connections(0)
            .max_idle_connections_per_host(0)
            .build();

        Self { agent: config.into() }
    }
}

impl Transport for HttpTransport {
    fn send(&self, url: &str, body: &[u8]) -> Result<Delivery, EmitError> {
        // A byte slice has a known size, so ureq sends Content-Length rather than chunking
        let response = self
            .agent
            .post(url)
            .header("Content-Type", "application/json")
            .header("Connection", "close")
            .send(body)
            .map_err(|source| EmitError::Connection {
                url: url.to_string(),
                source,
            })?;

        let status = response.status().as_u16();
        // Body is never read; dropping the response closes the connection
        drop(response);

        Ok(Delivery { status })
    }
}
