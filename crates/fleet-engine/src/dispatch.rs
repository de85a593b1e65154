use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, info, warn};

use fleet_core::config::RetryConfig;
use fleet_core::error::{FleetError, Result};

/// Where a unit of work is posted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub auth_token: Option<String>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }
}

/// Labels carried into every dispatch log line.
#[derive(Debug, Clone, Default)]
pub struct DispatchTrace {
    pub run_id: String,
    pub step: String,
}

/// Proof the transport accepted a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchReceipt {
    pub status: u16,
    pub attempts: u32,
}

/// Outbound transport. Returns the response status for any response the
/// remote side produced; only connection-level problems are errors.
pub trait Transport: Send + Sync + 'static {
    fn post(
        &self,
        endpoint: &Endpoint,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<u16>>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for HttpTransport {
    fn post(
        &self,
        endpoint: &Endpoint,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> BoxFuture<'_, Result<u16>> {
        let mut req = self.client.post(&endpoint.url).timeout(timeout).json(body);
        if let Some(token) = &endpoint.auth_token {
            req = req.bearer_auth(token);
        }
        Box::pin(async move {
            let resp = req.send().await.map_err(|e| FleetError::Dispatch {
                message: e.to_string(),
                retryable: e.is_timeout() || e.is_connect() || e.is_request(),
            })?;
            Ok(resp.status().as_u16())
        })
    }
}

fn classify(status: u16) -> std::result::Result<(), FleetError> {
    match status {
        200..=299 => Ok(()),
        429 | 500..=599 => Err(FleetError::Dispatch {
            message: format!("endpoint returned {}", status),
            retryable: true,
        }),
        _ => Err(FleetError::Dispatch {
            message: format!("endpoint rejected dispatch with {}", status),
            retryable: false,
        }),
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

/// Fire-and-forget step dispatch with bounded retries.
///
/// A dispatch completes as soon as the transport accepts it; the skill's
/// result arrives later through the completion callback.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn Transport>, retry: RetryConfig) -> Self {
        Self { transport, retry }
    }

    pub async fn dispatch<T: Serialize>(
        &self,
        endpoint: &Endpoint,
        payload: &T,
        timeout: Duration,
        trace: &DispatchTrace,
    ) -> Result<DispatchReceipt> {
        let body = serde_json::to_value(payload).map_err(|e| FleetError::Dispatch {
            message: format!("payload serialization failed: {}", e),
            retryable: false,
        })?;

        let max_retries = self.retry.max_retries;
        let mut last_err = None;
        for attempt in 0..=max_retries {
            let result = match self.transport.post(endpoint, &body, timeout).await {
                Ok(status) => classify(status).map(|_| status),
                Err(e) => Err(e),
            };
            match result {
                Ok(status) => {
                    debug!(
                        run_id = %trace.run_id,
                        step = %trace.step,
                        attempt = attempt + 1,
                        status,
                        "Dispatch accepted"
                    );
                    return Ok(DispatchReceipt {
                        status,
                        attempts: attempt + 1,
                    });
                }
                Err(e) => {
                    if e.is_retryable() && attempt < max_retries {
                        let backoff = calculate_backoff(attempt, &self.retry);
                        warn!(
                            run_id = %trace.run_id,
                            step = %trace.step,
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying dispatch"
                        );
                        tokio::time::sleep(backoff).await;
                        last_err = Some(e);
                        continue;
                    }
                    warn!(
                        run_id = %trace.run_id,
                        step = %trace.step,
                        attempt = attempt + 1,
                        error = %e,
                        "Dispatch failed"
                    );
                    last_err = Some(e);
                    break;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| FleetError::Dispatch {
            message: "dispatch failed".into(),
            retryable: false,
        }))
    }

    /// Dispatch on a background task; the outcome is only logged.
    pub fn fire_and_forget(
        self: &Arc<Self>,
        endpoint: Endpoint,
        payload: serde_json::Value,
        timeout: Duration,
        trace: DispatchTrace,
    ) -> tokio::task::JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            match dispatcher.dispatch(&endpoint, &payload, timeout, &trace).await {
                Ok(receipt) => info!(
                    run_id = %trace.run_id,
                    step = %trace.step,
                    attempts = receipt.attempts,
                    "Background dispatch accepted"
                ),
                Err(e) => warn!(
                    run_id = %trace.run_id,
                    step = %trace.step,
                    error = %e,
                    "Background dispatch failed"
                ),
            }
        })
    }
}
