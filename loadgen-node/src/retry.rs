//! Retrying request executor
//!
//! Wraps one [`Transport`] attempt in bounded exponential backoff. Each attempt
//! is classified into an explicit [`AttemptOutcome`]; only transport failures
//! and 408/429/5xx responses are retried.

use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Retry limits for one executor call site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Wait after the first failed attempt; doubles after each further failure
    pub base_backoff: Duration,
    /// Scale each wait by a uniform factor in `[0.5, 1.5]`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_millis(250),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered wait after failed attempt `attempt` (1-based)
    ///
    /// `base × 2^(attempt − 1)`, saturating on overflow.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor)
    }

    /// Wait actually used before the next attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.5..=1.5);
            backoff.mul_f64(factor)
        } else {
            backoff
        }
    }
}

/// Why an attempt is worth repeating
#[derive(Debug, Clone)]
pub enum RetryReason {
    /// No response at all (timeout, refused connection, ...)
    Transport(TransportError),
    /// 408, 429 or 5xx
    Status(HttpResponse),
}

/// Classification of a single attempt
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    /// 2xx, returned as is
    Success(HttpResponse),
    /// Try again if attempts remain
    Retryable(RetryReason),
    /// Any other status, returned without retrying
    Terminal(HttpResponse),
}

impl AttemptOutcome {
    pub fn classify(result: std::result::Result<HttpResponse, TransportError>) -> Self {
        match result {
            Err(e) => AttemptOutcome::Retryable(RetryReason::Transport(e)),
            Ok(response) if is_retryable_status(response.status) => {
                AttemptOutcome::Retryable(RetryReason::Status(response))
            }
            Ok(response) if (200..300).contains(&response.status) => {
                AttemptOutcome::Success(response)
            }
            Ok(response) => AttemptOutcome::Terminal(response),
        }
    }
}

/// 408 Request Timeout, 429 Too Many Requests and every 5xx
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Result of one executor call
#[derive(Debug, Clone)]
pub struct Execution {
    /// `None` when every attempt was retryable or the run was cancelled
    /// mid-backoff; distinct from a response with a failing status
    pub response: Option<HttpResponse>,
    /// Attempts actually sent
    pub attempts: u32,
    /// Last retryable failure seen, kept for diagnostics
    pub last_failure: Option<RetryReason>,
    /// A run-level stop interrupted the retry loop
    pub cancelled: bool,
}

impl Execution {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Executes requests with retry around a shared transport
#[derive(Clone)]
pub struct RetryingExecutor {
    transport: Arc<dyn Transport>,
}

impl RetryingExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send `request` until it succeeds, fails terminally, or `policy` is used up
    ///
    /// A cancelled `stop` token interrupts backoff waits immediately; an
    /// attempt already on the wire is allowed to finish within its own
    /// timeout.
    pub async fn execute(
        &self,
        request: &HttpRequest,
        policy: &RetryPolicy,
        stop: &CancellationToken,
    ) -> Execution {
        let max_attempts = policy.max_attempts.max(1);
        let mut last_failure = None;

        for attempt in 1..=max_attempts {
            let outcome = AttemptOutcome::classify(self.transport.send(request).await);

            let reason = match outcome {
                AttemptOutcome::Success(response) | AttemptOutcome::Terminal(response) => {
                    return Execution {
                        response: Some(response),
                        attempts: attempt,
                        last_failure,
                        cancelled: false,
                    };
                }
                AttemptOutcome::Retryable(RetryReason::Transport(e)) if !e.kind.is_retryable() => {
                    debug!(operation = %request.name, error = %e, "Request cannot be sent");
                    return Execution {
                        response: None,
                        attempts: attempt,
                        last_failure: Some(RetryReason::Transport(e)),
                        cancelled: false,
                    };
                }
                AttemptOutcome::Retryable(reason) => reason,
            };

            debug!(
                operation = %request.name,
                attempt = attempt,
                max_attempts = max_attempts,
                reason = %reason_label(&reason),
                "Retryable attempt failure"
            );
            last_failure = Some(reason);

            if attempt == max_attempts {
                break;
            }

            let wait = policy.delay(attempt);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop.cancelled() => {
                    return Execution {
                        response: None,
                        attempts: attempt,
                        last_failure,
                        cancelled: true,
                    };
                }
            }
        }

        Execution {
            response: None,
            attempts: max_attempts,
            last_failure,
            cancelled: false,
        }
    }
}

fn reason_label(reason: &RetryReason) -> String {
    match reason {
        RetryReason::Transport(e) => e.to_string(),
        RetryReason::Status(response) => format!("status {}", response.status),
    }
}
