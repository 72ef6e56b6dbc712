//! Liveness polling for a freshly spawned backend.
//!
//! [`wait_until_healthy`] probes at a fixed interval until the probe
//! succeeds or the budget runs out. Each probe is bounded by the remaining
//! budget, so a hung endpoint cannot stretch the wait past the deadline.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::BackendClient;
use crate::{AppError, Result};

/// A single liveness check against a backend base URL.
///
/// The HTTP implementation is [`HttpHealthProbe`]; tests substitute their
/// own to drive the supervisor without a real server.
pub trait HealthProbe: Send + Sync {
    /// Returns `true` when the backend at `base_url` reports healthy.
    fn probe<'a>(&'a self, base_url: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// Probes `GET {base_url}/health` through [`BackendClient::health`]; any
/// 2xx counts as healthy.
#[derive(Debug, Clone, Default)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    /// Probe using the given HTTP client.
    #[must_use]
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe<'a>(&'a self, base_url: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let client = BackendClient::with_http(self.client.clone(), base_url);
            match client.health().await {
                Ok(healthy) => healthy,
                Err(err) => {
                    debug!(%err, "health probe failed");
                    false
                }
            }
        })
    }
}

/// Poll `probe` every `interval` until it succeeds or `timeout` elapses.
///
/// Returns the time it took to become healthy.
///
/// # Errors
///
/// Returns `AppError::HealthTimeout` carrying the elapsed time once the
/// budget is exhausted. Never returns earlier than `timeout`.
pub async fn wait_until_healthy(
    probe: &dyn HealthProbe,
    base_url: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<Duration> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut attempts: u32 = 0;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(AppError::HealthTimeout(started.elapsed()));
        }

        attempts += 1;
        let healthy = tokio::time::timeout(remaining, probe.probe(base_url))
            .await
            .unwrap_or(false);
        if healthy {
            let elapsed = started.elapsed();
            info!(attempts, elapsed_ms = elapsed.as_millis(), "backend became healthy");
            return Ok(elapsed);
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(interval.min(remaining)).await;
    }
}
