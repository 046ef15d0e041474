//! Run orchestration
//!
//! `prepare` resolves everything that can fail before a single request goes
//! out: profile, operations, token, dataset and thresholds. Only a
//! [`PreparedRun`] can be scheduled, so configuration errors never reach the
//! VUs.

use crate::config::LoadgenConfig;
use crate::dataset::{Dataset, DatasetProvider};
use crate::error::{LoadgenError, Result};
use crate::metrics::{MetricsRegistry, ProfileMetrics};
use crate::profile::{
    ClientProfile, Operation, OperationSelection, ProfileRegistry, RampPlan, ThinkTime,
};
use crate::report::RunSummary;
use crate::retry::RetryPolicy;
use crate::runner::OperationRunner;
use crate::scheduler::RampScheduler;
use crate::secret::{Secret, TokenDiagnostics};
use crate::threshold::ThresholdSet;
use crate::transport::Transport;
use crate::vu::VuContext;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub struct Harness {
    config: LoadgenConfig,
    registry: ProfileRegistry,
    transport: Arc<dyn Transport>,
    datasets: DatasetProvider,
    env: EnvLookup,
}

impl Harness {
    pub fn new(
        config: LoadgenConfig,
        registry: ProfileRegistry,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            config,
            registry,
            transport,
            datasets: DatasetProvider::new(),
            env: Arc::new(|name| std::env::var(name).ok()),
        }
    }

    /// Read tokens through `lookup` instead of the process environment
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env = Arc::new(lookup);
        self
    }

    pub fn with_datasets(mut self, datasets: DatasetProvider) -> Self {
        self.datasets = datasets;
        self
    }

    pub fn config(&self) -> &LoadgenConfig {
        &self.config
    }

    /// Resolve and check everything the run needs
    pub fn prepare(&self) -> Result<PreparedRun> {
        let base = self.registry.lookup(&self.config.run.profile)?;
        let mut profile = ClientProfile::clone(&base);
        profile.ramp.apply_overrides(&self.config.ramp)?;
        profile.think = self.config.think_time(profile.think)?;

        let selection = self.config.selection();
        let operations = profile.select(&selection)?;

        info!(
            client = %profile.key,
            dataset = %profile.dataset.display(),
            ramp = %format!("{}->{}", profile.ramp.start_vus, profile.ramp.final_target()),
            operations = %selection,
            "Boot"
        );

        let raw_token = (self.env)(&profile.token_env).unwrap_or_default();
        let token = Secret::bearer_for_profile(&raw_token, &profile.token_env, &profile.name)?;
        let auth = TokenDiagnostics::new(&profile.token_env, &raw_token, &token);

        let dataset = self.datasets.load(&profile.dataset, &profile.row_filter)?;

        let names = ProfileMetrics::new(&profile.name);
        let thresholds = self
            .config
            .thresholds
            .build(&names, operations.iter().map(|op| op.key.as_str()))?;

        let metrics = MetricsRegistry::new();
        let policy = self.config.retry_policy();
        let runner = OperationRunner::new(
            &profile,
            operations,
            token,
            Arc::clone(&self.transport),
            policy.clone(),
            self.config.http_timeout(),
            metrics.clone(),
        );
        let ctx = VuContext::new(runner, dataset, profile.think, metrics.clone())
            .with_auth(auth)
            .with_iteration_limit(self.config.run.iterations_per_vu);

        Ok(PreparedRun {
            profile,
            selection,
            policy,
            ctx: Arc::new(ctx),
            thresholds,
            names,
            metrics,
            tick: self.config.tick(),
            deadline: self.config.deadline(),
        })
    }

    pub async fn run(&self, stop: CancellationToken) -> Result<RunSummary> {
        let prepared = self.prepare()?;
        Ok(prepared.execute(stop).await)
    }
}

/// Human-facing description of a prepared run
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub profile: String,
    pub dataset: String,
    pub rows: usize,
    pub operations: Vec<String>,
    pub ramp: RampPlan,
    pub think: ThinkTime,
    pub retry: RetryPolicy,
    pub thresholds: Vec<String>,
}

impl RunPlan {
    pub fn log(&self) {
        info!(
            profile = %self.profile,
            dataset = %self.dataset,
            rows = self.rows,
            "Dry run: nothing will be sent"
        );
        for op in &self.operations {
            info!(operation = %op, "Planned operation");
        }
        info!(
            start_vus = self.ramp.start_vus,
            max_vus = self.ramp.max_vus(),
            mode = ?self.ramp.mode,
            total = ?self.ramp.total_duration(),
            graceful_ramp_down = ?self.ramp.graceful_ramp_down,
            "Planned ramp"
        );
        for (index, stage) in self.ramp.stages.iter().enumerate() {
            info!(stage = index + 1, target = stage.target, duration = ?stage.duration, "Planned stage");
        }
        info!(
            think_min = ?self.think.min,
            think_max = ?self.think.max,
            tries = self.retry.max_attempts,
            base_backoff = ?self.retry.base_backoff,
            "Planned pacing"
        );
        for threshold in &self.thresholds {
            info!(threshold = %threshold, "Planned threshold");
        }
    }
}

/// A run whose preconditions all hold
pub struct PreparedRun {
    profile: ClientProfile,
    selection: OperationSelection,
    policy: RetryPolicy,
    ctx: Arc<VuContext>,
    thresholds: ThresholdSet,
    names: ProfileMetrics,
    metrics: MetricsRegistry,
    tick: Duration,
    deadline: Option<Duration>,
}

impl PreparedRun {
    pub fn profile(&self) -> &ClientProfile {
        &self.profile
    }

    /// Operations each iteration runs, in order
    pub fn operations(&self) -> &[Operation] {
        self.ctx.runner.operations()
    }

    pub fn dataset(&self) -> &Dataset {
        &self.ctx.dataset
    }

    pub fn plan(&self) -> RunPlan {
        RunPlan {
            profile: self.profile.key.clone(),
            dataset: self.ctx.dataset.location().display().to_string(),
            rows: self.ctx.dataset.len(),
            operations: self
                .ctx
                .runner
                .operations()
                .iter()
                .map(|op| format!("{} {} {} ({})", op.key, op.method, op.url, op.payload.kind()))
                .collect(),
            ramp: self.profile.ramp.clone(),
            think: self.profile.think,
            retry: self.policy.clone(),
            thresholds: self
                .thresholds
                .specs()
                .iter()
                .flat_map(|spec| {
                    spec.expressions
                        .iter()
                        .map(move |e| format!("{}: {}", spec.metric, e))
                })
                .collect(),
        }
    }

    /// Schedule VUs, then aggregate and evaluate thresholds exactly once
    pub async fn execute(self, stop: CancellationToken) -> RunSummary {
        let run_stop = stop.child_token();
        let deadline = self.deadline.map(|limit| {
            let token = run_stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(deadline = ?limit, "Run deadline reached");
                token.cancel();
            })
        });

        let started_at = Utc::now();
        let schedule = RampScheduler::new(self.profile.ramp.clone(), Arc::clone(&self.ctx), self.tick)
            .run(run_stop)
            .await;
        let finished_at = Utc::now();

        if let Some(handle) = deadline {
            handle.abort();
        }

        let aggregates = self.metrics.aggregate();
        let report = self.thresholds.evaluate(&aggregates);

        RunSummary::new(
            &self.profile.key,
            &self.selection.to_string(),
            started_at,
            finished_at,
            schedule.stopped_early,
            &self.names,
            aggregates,
            report,
        )
    }
}
