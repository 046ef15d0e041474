//! Operation runner
//!
//! Runs the selected operations of one profile for a single VU iteration:
//! layered headers, payload from the row, retrying execution, then metrics.
//! Failures are logged and recorded, never propagated.

use crate::dataset::Row;
use crate::metrics::{MetricsRegistry, ProfileMetrics, HTTP_REQ_FAILED};
use crate::profile::{ClientProfile, Operation};
use crate::retry::{RetryPolicy, RetryReason, RetryingExecutor};
use crate::secret::Secret;
use crate::transport::{Headers, HttpRequest, Transport};
use crate::vu::VuState;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Response bodies are cut to this many characters in failure logs
pub const BODY_LOG_LIMIT: usize = 200;

/// Only these statuses count as success
pub fn is_success(status: u16) -> bool {
    matches!(status, 200 | 201)
}

/// Result of one operation within an iteration
#[derive(Debug, Clone, PartialEq)]
pub struct OperationOutcome {
    pub key: String,
    pub status: Option<u16>,
    pub success: bool,
    pub attempts: u32,
    pub elapsed: Duration,
}

pub struct OperationRunner {
    profile_name: String,
    names: ProfileMetrics,
    token: Secret<String>,
    profile_headers: BTreeMap<String, String>,
    operations: Vec<Operation>,
    executor: RetryingExecutor,
    policy: RetryPolicy,
    timeout: Duration,
    metrics: MetricsRegistry,
}

impl OperationRunner {
    pub fn new(
        profile: &ClientProfile,
        operations: Vec<Operation>,
        token: Secret<String>,
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        timeout: Duration,
        metrics: MetricsRegistry,
    ) -> Self {
        let names = ProfileMetrics::new(&profile.name);
        names.declare(&metrics, operations.iter().map(|op| op.key.as_str()));

        Self {
            profile_name: profile.name.clone(),
            names,
            token,
            profile_headers: profile.extra_headers.clone(),
            operations,
            executor: RetryingExecutor::new(transport),
            policy,
            timeout,
            metrics,
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn metric_names(&self) -> &ProfileMetrics {
        &self.names
    }

    /// Defaults, then profile headers, then operation headers; later layers win
    pub fn headers_for(&self, op: &Operation) -> Headers {
        let mut headers = Headers::new();
        headers.insert("Authorization", self.token.expose_secret().as_str());
        headers.insert("Accept", "application/json");
        headers.insert("Content-Type", op.content_type.as_str());
        headers.insert("Accept-Encoding", "identity");
        headers.extend(&self.profile_headers);
        headers.extend(&op.extra_headers);
        headers
    }

    pub fn request_for(&self, op: &Operation, row: &Row) -> HttpRequest {
        HttpRequest {
            name: op.key.clone(),
            method: op.method.clone(),
            url: op.url.clone(),
            headers: self.headers_for(op),
            body: op.payload.build(row),
            timeout: self.timeout,
        }
    }

    /// Run every selected operation once, strictly in declared order
    ///
    /// Stops early when `stop` fires; an operation abandoned mid-retry is not
    /// recorded.
    pub async fn run_iteration(
        &self,
        vu: &VuState,
        row: &Row,
        stop: &CancellationToken,
    ) -> Vec<OperationOutcome> {
        let mut outcomes = Vec::with_capacity(self.operations.len());

        for op in &self.operations {
            if stop.is_cancelled() {
                break;
            }

            let request = self.request_for(op, row);
            let started = Instant::now();
            let execution = self.executor.execute(&request, &self.policy, stop).await;
            let elapsed = started.elapsed();

            if execution.cancelled {
                debug!(
                    profile = %self.profile_name,
                    operation = %op.key,
                    vu = vu.id,
                    "Operation abandoned by stop signal"
                );
                break;
            }

            let status = execution.response.as_ref().map(|r| r.status);
            let success = status.map(is_success).unwrap_or(false);
            let received = match (&execution.response, &execution.last_failure) {
                (Some(response), _) | (None, Some(RetryReason::Status(response))) => {
                    Some(response.body.len())
                }
                _ => None,
            };
            self.record(op, elapsed, success, execution.retries());
            self.record_sizes(request.body.to_string().len(), received);

            if !success {
                let body = match (&execution.response, &execution.last_failure) {
                    (Some(response), _) => truncate(&response.body, BODY_LOG_LIMIT),
                    (None, Some(RetryReason::Status(response))) => {
                        truncate(&response.body, BODY_LOG_LIMIT)
                    }
                    (None, Some(RetryReason::Transport(e))) => truncate(&e.to_string(), BODY_LOG_LIMIT),
                    (None, None) => String::new(),
                };
                warn!(
                    profile = %self.profile_name,
                    operation = %op.key,
                    vu = vu.id,
                    iteration = vu.iteration,
                    status = ?status,
                    attempts = execution.attempts,
                    body = %body,
                    "Non-OK response"
                );
            }

            outcomes.push(OperationOutcome {
                key: op.key.clone(),
                status,
                success,
                attempts: execution.attempts,
                elapsed,
            });
        }

        outcomes
    }

    fn record(&self, op: &Operation, elapsed: Duration, success: bool, retries: u32) {
        let millis = elapsed.as_secs_f64() * 1000.0;
        self.metrics
            .add_trend(&self.names.operation_duration(&op.key), millis);
        self.metrics.add_trend(&self.names.req_duration, millis);
        self.metrics.add_rate(&self.names.error_rate, !success);
        self.metrics.add_rate(HTTP_REQ_FAILED, !success);
        if retries > 0 {
            self.metrics
                .add_counter(&self.names.retries, f64::from(retries));
        }
    }

    fn record_sizes(&self, sent: usize, received: Option<usize>) {
        self.metrics.add_trend(&self.names.req_bytes, sent as f64);
        if let Some(received) = received {
            self.metrics.add_trend(&self.names.res_bytes, received as f64);
        }
    }
}

/// First `limit` characters of `body`
fn truncate(body: &str, limit: usize) -> String {
    body.chars().take(limit).collect()
}
