use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use super::transport::{LedgerTransport, TransportError};
use crate::telemetry;

pub const DEFAULT_RETRY_COUNT: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries per endpoint after the first attempt.
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: DEFAULT_RETRY_COUNT,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn attempts_per_endpoint(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }
}

/// Tries endpoints in priority order. Each endpoint gets the full retry
/// budget before the next one is consulted; the first success wins.
pub struct FallbackTransport {
    endpoints: Vec<Arc<dyn LedgerTransport>>,
    policy: RetryPolicy,
    label: String,
}

impl FallbackTransport {
    pub fn new(endpoints: Vec<Arc<dyn LedgerTransport>>, policy: RetryPolicy) -> Self {
        let label = endpoints
            .iter()
            .map(|endpoint| endpoint.label().to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            endpoints,
            policy,
            label,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.len()
    }
}

#[async_trait]
impl LedgerTransport for FallbackTransport {
    fn label(&self) -> &str {
        &self.label
    }

    async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let mut attempts = 0u32;
        let mut last_error = None;

        for endpoint in &self.endpoints {
            for attempt in 0..self.policy.attempts_per_endpoint() {
                if attempt > 0 {
                    sleep(self.policy.retry_delay).await;
                }
                attempts += 1;
                match endpoint.request(method, params.clone()).await {
                    Ok(value) => {
                        telemetry::record_gateway_request(endpoint.label(), method, "ok");
                        return Ok(value);
                    }
                    Err(err) => {
                        telemetry::record_gateway_request(endpoint.label(), method, err.label());
                        debug!(
                            endpoint = endpoint.label(),
                            method,
                            attempt,
                            error = %err,
                            "ledger request failed"
                        );
                        if !err.is_retryable() {
                            return Err(err);
                        }
                        last_error = Some(err);
                    }
                }
            }
            warn!(
                endpoint = endpoint.label(),
                method, "ledger endpoint exhausted its retries, falling back"
            );
        }

        match last_error {
            Some(last) => Err(TransportError::Exhausted {
                attempts,
                last: Box::new(last),
            }),
            None => Err(TransportError::NoEndpoints),
        }
    }
}
