//! Virtual user loop
//!
//! A VU keeps the row it was assigned for its whole life and iterates until
//! it is retired, the run stops, or it uses up its iteration allowance.

use crate::dataset::Dataset;
use crate::metrics::{MetricsRegistry, ITERATIONS};
use crate::profile::ThinkTime;
use crate::runner::OperationRunner;
use crate::secret::TokenDiagnostics;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Identity and progress of one VU; owned by its task only
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VuState {
    pub id: u64,
    pub iteration: u64,
}

impl VuState {
    pub fn new(id: u64) -> Self {
        Self { id, iteration: 0 }
    }

    pub fn is_first_iteration(&self) -> bool {
        self.iteration == 0
    }

    pub fn advance(&mut self) {
        self.iteration += 1;
    }
}

/// Everything VUs share, read-only apart from the metrics store
pub struct VuContext {
    pub runner: OperationRunner,
    pub dataset: Dataset,
    pub think: ThinkTime,
    pub metrics: MetricsRegistry,
    /// Logged once, on the first iteration of VU 1
    pub auth: Option<TokenDiagnostics>,
    pub iteration_limit: Option<u64>,
    auth_logged: AtomicBool,
}

impl VuContext {
    pub fn new(
        runner: OperationRunner,
        dataset: Dataset,
        think: ThinkTime,
        metrics: MetricsRegistry,
    ) -> Self {
        Self {
            runner,
            dataset,
            think,
            metrics,
            auth: None,
            iteration_limit: None,
            auth_logged: AtomicBool::new(false),
        }
    }

    pub fn with_auth(mut self, auth: TokenDiagnostics) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_iteration_limit(mut self, limit: Option<u64>) -> Self {
        self.iteration_limit = limit;
        self
    }

    fn log_auth_once(&self, state: &VuState) {
        if state.id != 1 || !state.is_first_iteration() {
            return;
        }
        if let Some(auth) = &self.auth {
            if !self.auth_logged.swap(true, Ordering::SeqCst) {
                auth.log();
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VuExit {
    /// Scale-down or end of plan
    Retired,
    /// Run-level stop
    Stopped,
    IterationLimit,
    /// Nothing to assign; never happens once the dataset is checked
    NoRow,
}

/// What a finished VU hands back to the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VuReport {
    pub state: VuState,
    pub row_index: Option<usize>,
    pub exit: VuExit,
}

/// Iterate until `retire` or `stop` fires
///
/// `retire` must be a child of `stop`. Retirement lets the current iteration
/// finish; `stop` also cuts retry backoff short inside the iteration.
pub async fn run_vu(
    ctx: Arc<VuContext>,
    id: u64,
    retire: CancellationToken,
    stop: CancellationToken,
) -> VuReport {
    let mut state = VuState::new(id);

    let Some((row_index, row)) = ctx.dataset.row_for_vu(id) else {
        error!(vu = id, dataset = %ctx.dataset.location().display(), "No rows to assign");
        return VuReport {
            state,
            row_index: None,
            exit: VuExit::NoRow,
        };
    };
    debug!(vu = id, row = row_index, "VU started");

    let exit = loop {
        if stop.is_cancelled() {
            break VuExit::Stopped;
        }
        if retire.is_cancelled() {
            break VuExit::Retired;
        }
        if ctx
            .iteration_limit
            .is_some_and(|limit| state.iteration >= limit)
        {
            break VuExit::IterationLimit;
        }

        ctx.log_auth_once(&state);
        ctx.runner.run_iteration(&state, row, &stop).await;
        if stop.is_cancelled() {
            break VuExit::Stopped;
        }
        ctx.metrics.add_counter(ITERATIONS, 1.0);
        state.advance();

        let pause = ctx.think.sample(&mut rand::thread_rng());
        if pause.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = retire.cancelled() => {}
        }
    };

    debug!(vu = id, iterations = state.iteration, exit = ?exit, "VU finished");
    VuReport {
        state,
        row_index: Some(row_index),
        exit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Row, RowFilter};
    use crate::payload::payload_fn;
    use crate::profile::{ClientProfile, Operation, RampMode, RampPlan, Stage};
    use crate::retry::RetryPolicy;
    use crate::secret::Secret;
    use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Transport for Counting {
        async fn send(
            &self,
            _request: &HttpRequest,
        ) -> std::result::Result<HttpResponse, TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(200, "{}"))
        }
    }

    fn context(transport: Arc<Counting>, think: ThinkTime) -> VuContext {
        let profile = ClientProfile {
            key: "local".to_string(),
            name: "Local".to_string(),
            token_env: "TOKEN_LOCAL".to_string(),
            dataset: PathBuf::from("local.csv"),
            row_filter: RowFilter::NonEmpty,
            extra_headers: BTreeMap::new(),
            operations: vec![Operation::post(
                "markdown",
                "http://origin/markdown",
                payload_fn(|_| json!({})),
            )],
            ramp: RampPlan {
                start_vus: 1,
                stages: vec![Stage {
                    target: 1,
                    duration: Duration::from_secs(1),
                }],
                graceful_ramp_down: Duration::ZERO,
                mode: RampMode::Step,
            },
            think,
        };
        let metrics = MetricsRegistry::new();
        let runner = OperationRunner::new(
            &profile,
            profile.operations.clone(),
            Secret::new("Bearer t".to_string()),
            transport,
            RetryPolicy::default(),
            Duration::from_secs(5),
            metrics.clone(),
        );
        let rows = (0..3)
            .map(|i| Row::from_pairs([("ID", i.to_string())]))
            .collect();
        VuContext::new(runner, Dataset::new("local.csv", rows), think, metrics)
    }

    #[test]
    fn test_vu_state_advances() {
        let mut state = VuState::new(4);
        assert!(state.is_first_iteration());
        state.advance();
        assert_eq!(state.iteration, 1);
        assert!(!state.is_first_iteration());
    }

    #[tokio::test(start_paused = true)]
    async fn test_iteration_limit() {
        let transport = Arc::new(Counting(AtomicUsize::new(0)));
        let ctx = Arc::new(
            context(Arc::clone(&transport), ThinkTime::none()).with_iteration_limit(Some(3)),
        );

        let stop = CancellationToken::new();
        let report = run_vu(ctx, 5, stop.child_token(), stop.clone()).await;
        assert_eq!(report.exit, VuExit::IterationLimit);
        assert_eq!(report.state.iteration, 3);
        // vu 5 over 3 rows
        assert_eq!(report.row_index, Some(1));
        assert_eq!(transport.0.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retire_interrupts_think_time() {
        let transport = Arc::new(Counting(AtomicUsize::new(0)));
        let think = ThinkTime::new(60_000, 60_000).unwrap();
        let ctx = Arc::new(context(Arc::clone(&transport), think));

        let stop = CancellationToken::new();
        let retire = stop.child_token();
        let handle = tokio::spawn(run_vu(ctx, 1, retire.clone(), stop.clone()));

        tokio::time::sleep(Duration::from_millis(10)).await;
        retire.cancel();
        let report = handle.await.unwrap();

        assert_eq!(report.exit, VuExit::Retired);
        assert_eq!(report.state.iteration, 1);
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stopped_vu_sends_nothing() {
        let transport = Arc::new(Counting(AtomicUsize::new(0)));
        let ctx = Arc::new(context(Arc::clone(&transport), ThinkTime::none()));
        let stop = CancellationToken::new();
        stop.cancel();

        let report = run_vu(ctx, 2, stop.child_token(), stop.clone()).await;
        assert_eq!(report.exit, VuExit::Stopped);
        assert_eq!(transport.0.load(Ordering::SeqCst), 0);
    }
}
