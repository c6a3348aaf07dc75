//! Shared outbound HTTP client for container upstreams.

use parking_lot::RwLock;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::UpstreamConfig;
use crate::error::ProxyError;

/// Lazily-built, connection-pooled client shared by all HTTP relays.
///
/// `reqwest::Client` is internally reference counted, so callers get a cheap
/// clone and never hold the lock across I/O. After `close()` the next caller
/// transparently builds a fresh client.
pub struct UpstreamPool {
    timeouts: UpstreamConfig,
    client: RwLock<Option<reqwest::Client>>,
}

impl UpstreamPool {
    pub fn new(timeouts: UpstreamConfig) -> Self {
        Self {
            timeouts,
            client: RwLock::new(None),
        }
    }

    /// Current client, creating one if none is open.
    pub fn client(&self) -> Result<reqwest::Client, ProxyError> {
        if let Some(client) = self.client.read().as_ref() {
            return Ok(client.clone());
        }

        let mut slot = self.client.write();
        // Another request may have won the race while we waited.
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let client = self
            .build()
            .map_err(|e| ProxyError::Internal(format!("failed to build upstream client: {e}")))?;
        debug!("Created upstream client");
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Drop the pooled client; idle connections close once in-flight
    /// requests holding a clone finish.
    pub fn close(&self) {
        if self.client.write().take().is_some() {
            info!("Closed upstream client pool");
        }
    }

    pub fn is_open(&self) -> bool {
        self.client.read().is_some()
    }

    /// Upper bound on waiting for response headers: acquiring a connection,
    /// writing the request, then the first read.
    pub fn send_timeout(&self) -> Duration {
        self.timeouts.pool_timeout() + self.timeouts.write_timeout() + self.timeouts.read_timeout()
    }

    fn build(&self) -> reqwest::Result<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.timeouts.connect_timeout())
            .read_timeout(self.timeouts.read_timeout())
            .pool_idle_timeout(Duration::from_secs(90))
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
    }

    /// Send a request, mapping transport failures onto proxy errors.
    pub async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ProxyError> {
        match tokio::time::timeout(self.send_timeout(), request.send()).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(classify(&e)),
            Err(_) => Err(ProxyError::UpstreamTimeout),
        }
    }
}

/// Map a transport error onto the proxy taxonomy. Timeouts win over connect
/// failures so a connect timeout reports 504.
pub fn classify(err: &reqwest::Error) -> ProxyError {
    if err.is_timeout() {
        ProxyError::UpstreamTimeout
    } else if err.is_connect() {
        ProxyError::UpstreamUnreachable
    } else {
        ProxyError::UpstreamProtocol(err.to_string())
    }
}
