//! Ramp scheduler
//!
//! Re-evaluates the [`RampPlan`] every tick and grows or shrinks the live VU
//! population to match. Scale-up admits the lowest free VU ids, scale-down
//! retires the highest ones; a retired VU finishes its current iteration
//! before it exits.

use crate::metrics::{MetricsRegistry, VUS_MAX};
use crate::profile::RampPlan;
use crate::vu::{run_vu, VuContext, VuReport};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct Slot {
    retire: CancellationToken,
    handle: JoinHandle<VuReport>,
}

/// Outcome of a scheduled run
#[derive(Debug, Clone)]
pub struct ScheduleReport {
    pub vus: Vec<VuReport>,
    pub peak_vus: usize,
    pub elapsed: Duration,
    /// An external stop ended the run before the plan did
    pub stopped_early: bool,
}

pub struct RampScheduler {
    plan: RampPlan,
    ctx: Arc<VuContext>,
    metrics: MetricsRegistry,
    tick: Duration,
    active: BTreeMap<u64, Slot>,
    retiring: Vec<(u64, JoinHandle<VuReport>)>,
    finished: Vec<VuReport>,
    peak_vus: usize,
}

impl RampScheduler {
    pub fn new(plan: RampPlan, ctx: Arc<VuContext>, tick: Duration) -> Self {
        let metrics = ctx.metrics.clone();
        Self {
            plan,
            ctx,
            metrics,
            tick: tick.max(Duration::from_millis(1)),
            active: BTreeMap::new(),
            retiring: Vec::new(),
            finished: Vec::new(),
            peak_vus: 0,
        }
    }

    /// Drive the plan to completion, or until `stop` fires
    pub async fn run(mut self, stop: CancellationToken) -> ScheduleReport {
        let started = Instant::now();
        let vu_stop = stop.child_token();

        info!(
            start_vus = self.plan.start_vus,
            stages = self.plan.stages.len(),
            mode = ?self.plan.mode,
            total = ?self.plan.total_duration(),
            "Ramp started"
        );
        self.scale_to(self.plan.start_vus as usize, &vu_stop);

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut current_stage = None;
        let mut stopped_early = false;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.cancelled() => {
                    stopped_early = true;
                    break;
                }
            }
            self.reap().await;

            let elapsed = started.elapsed();
            let Some(target) = self.plan.target_at(elapsed) else {
                break;
            };

            let stage = self.plan.stage_at(elapsed);
            if stage != current_stage {
                if let Some(index) = stage {
                    info!(
                        stage = index + 1,
                        of = self.plan.stages.len(),
                        target = self.plan.stages[index].target,
                        duration = ?self.plan.stages[index].duration,
                        "Ramp stage started"
                    );
                }
                current_stage = stage;
            }

            self.scale_to(target as usize, &vu_stop);

            if self.ctx.iteration_limit.is_some() && self.all_done() {
                info!("Every VU used its iteration allowance");
                break;
            }
        }

        self.drain(&vu_stop).await;

        let elapsed = started.elapsed();
        info!(
            elapsed = ?elapsed,
            peak_vus = self.peak_vus,
            vus = self.finished.len(),
            stopped_early,
            "Ramp finished"
        );

        self.finished.sort_by_key(|r| (r.state.id, r.state.iteration));
        ScheduleReport {
            vus: self.finished,
            peak_vus: self.peak_vus,
            elapsed,
            stopped_early,
        }
    }

    fn all_done(&self) -> bool {
        self.retiring.is_empty()
            && !self.active.is_empty()
            && self.active.values().all(|slot| slot.handle.is_finished())
    }

    fn scale_to(&mut self, target: usize, vu_stop: &CancellationToken) {
        let current = self.active.len();

        if target > current {
            for _ in current..target {
                let id = self.lowest_free_id();
                let retire = vu_stop.child_token();
                let handle = tokio::spawn(run_vu(
                    Arc::clone(&self.ctx),
                    id,
                    retire.clone(),
                    vu_stop.clone(),
                ));
                self.active.insert(id, Slot { retire, handle });
            }
            debug!(from = current, to = target, "Scaled up");
        } else if target < current {
            for _ in target..current {
                if let Some((id, slot)) = self.active.pop_last() {
                    slot.retire.cancel();
                    self.retiring.push((id, slot.handle));
                }
            }
            debug!(from = current, to = target, "Scaled down");
        }

        self.peak_vus = self.peak_vus.max(self.active.len());
        self.metrics.set_gauge(VUS_MAX, self.active.len() as f64);
    }

    fn lowest_free_id(&self) -> u64 {
        let retiring: BTreeSet<u64> = self.retiring.iter().map(|(id, _)| *id).collect();
        (1..)
            .find(|id| !self.active.contains_key(id) && !retiring.contains(id))
            .unwrap_or(u64::MAX)
    }

    /// Collect retired VUs that have exited
    async fn reap(&mut self) {
        let (done, pending): (Vec<_>, Vec<_>) = self
            .retiring
            .drain(..)
            .partition(|(_, handle)| handle.is_finished());
        self.retiring = pending;
        for (id, handle) in done {
            self.collect(id, handle.await);
        }
    }

    /// Retire everyone, wait out the graceful ramp-down, then force the stop
    async fn drain(&mut self, vu_stop: &CancellationToken) {
        while let Some((id, slot)) = self.active.pop_last() {
            slot.retire.cancel();
            self.retiring.push((id, slot.handle));
        }
        self.metrics.set_gauge(VUS_MAX, 0.0);

        let (ids, handles): (Vec<_>, Vec<_>) = self.retiring.drain(..).unzip();
        let grace = self.plan.graceful_ramp_down;
        let mut joined = Box::pin(join_all(handles));

        let results = match tokio::time::timeout(grace, &mut joined).await {
            Ok(results) => results,
            Err(_) => {
                warn!(
                    grace = ?grace,
                    "Graceful ramp-down elapsed, stopping remaining VUs"
                );
                vu_stop.cancel();
                joined.await
            }
        };
        vu_stop.cancel();

        for (id, result) in ids.into_iter().zip(results) {
            self.collect(id, result);
        }
    }

    fn collect(&mut self, id: u64, result: Result<VuReport, tokio::task::JoinError>) {
        match result {
            Ok(report) => self.finished.push(report),
            Err(e) => error!(vu = id, error = %e, "VU task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{Dataset, Row, RowFilter};
    use crate::payload::payload_fn;
    use crate::profile::{ClientProfile, Operation, RampMode, Stage, ThinkTime};
    use crate::retry::RetryPolicy;
    use crate::runner::OperationRunner;
    use crate::secret::Secret;
    use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};
    use crate::vu::VuExit;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ok200(AtomicUsize);

    #[async_trait]
    impl Transport for Ok200 {
        async fn send(
            &self,
            _request: &HttpRequest,
        ) -> std::result::Result<HttpResponse, TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(200, "{}"))
        }
    }

    fn plan(start_vus: u32, stages: &[(u32, u64)], grace_secs: u64) -> RampPlan {
        RampPlan {
            start_vus,
            stages: stages
                .iter()
                .map(|(target, secs)| Stage {
                    target: *target,
                    duration: Duration::from_secs(*secs),
                })
                .collect(),
            graceful_ramp_down: Duration::from_secs(grace_secs),
            mode: RampMode::Step,
        }
    }

    struct Unavailable(AtomicUsize);

    #[async_trait]
    impl Transport for Unavailable {
        async fn send(
            &self,
            _request: &HttpRequest,
        ) -> std::result::Result<HttpResponse, TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse::new(503, "busy"))
        }
    }

    fn linear(start_vus: u32, stages: &[(u32, u64)], grace_secs: u64) -> RampPlan {
        RampPlan {
            mode: RampMode::Linear,
            ..plan(start_vus, stages, grace_secs)
        }
    }

    fn context(
        transport: Arc<Ok200>,
        rows: usize,
        think: ThinkTime,
        limit: Option<u64>,
    ) -> Arc<VuContext> {
        context_with(transport, RetryPolicy::default(), rows, think, limit)
    }

    fn context_with(
        transport: Arc<dyn Transport>,
        policy: RetryPolicy,
        rows: usize,
        think: ThinkTime,
        limit: Option<u64>,
    ) -> Arc<VuContext> {
        let profile = ClientProfile {
            key: "local".to_string(),
            name: "Local".to_string(),
            token_env: "TOKEN_LOCAL".to_string(),
            dataset: PathBuf::from("local.csv"),
            row_filter: RowFilter::NonEmpty,
            extra_headers: Default::default(),
            operations: vec![Operation::post(
                "markdown",
                "http://origin/markdown",
                payload_fn(|_| json!({})),
            )],
            ramp: plan(1, &[(1, 1)], 0),
            think,
        };
        let metrics = MetricsRegistry::new();
        let runner = OperationRunner::new(
            &profile,
            profile.operations.clone(),
            Secret::new("Bearer t".to_string()),
            transport,
            policy,
            Duration::from_secs(5),
            metrics.clone(),
        );
        let rows = (0..rows)
            .map(|i| Row::from_pairs([("ID", i.to_string())]))
            .collect();
        Arc::new(
            VuContext::new(runner, Dataset::new("local.csv", rows), think, metrics)
                .with_iteration_limit(limit),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_iteration_per_vu_uses_distinct_rows() {
        let transport = Arc::new(Ok200(AtomicUsize::new(0)));
        let ctx = context(Arc::clone(&transport), 3, ThinkTime::none(), Some(1));

        let report = RampScheduler::new(plan(3, &[(3, 60)], 5), ctx, Duration::from_millis(250))
            .run(CancellationToken::new())
            .await;

        assert_eq!(transport.0.load(Ordering::SeqCst), 3);
        assert_eq!(report.vus.len(), 3);
        assert_eq!(report.peak_vus, 3);
        let rows: Vec<_> = report.vus.iter().map(|r| r.row_index).collect();
        assert_eq!(rows, vec![Some(0), Some(1), Some(2)]);
        assert!(report.vus.iter().all(|r| r.exit == VuExit::IterationLimit));
        assert!(report.elapsed < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_retires_highest_ids() {
        let transport = Arc::new(Ok200(AtomicUsize::new(0)));
        let think = ThinkTime::new(100, 100).unwrap();
        let ctx = context(Arc::clone(&transport), 10, think, None);

        let report = RampScheduler::new(
            plan(0, &[(4, 2), (1, 2)], 1),
            ctx,
            Duration::from_millis(100),
        )
        .run(CancellationToken::new())
        .await;

        assert!(!report.stopped_early);
        assert_eq!(report.peak_vus, 4);
        let ids: Vec<u64> = report.vus.iter().map(|r| r.state.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);

        // vu 1 survives the scale-down and runs longest
        let iterations: Vec<u64> = report.vus.iter().map(|r| r.state.iteration).collect();
        assert!(iterations[0] > iterations[3]);
        assert!(report.vus.iter().all(|r| r.exit == VuExit::Retired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_stop_ends_run() {
        let transport = Arc::new(Ok200(AtomicUsize::new(0)));
        let think = ThinkTime::new(1000, 1000).unwrap();
        let ctx = context(Arc::clone(&transport), 2, think, None);
        let stop = CancellationToken::new();

        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let report = RampScheduler::new(plan(2, &[(2, 3600)], 30), ctx, Duration::from_millis(250))
            .run(stop)
            .await;

        assert!(report.stopped_early);
        assert_eq!(report.vus.len(), 2);
        assert!(report.elapsed < Duration::from_secs(60));
    }

    fn stop_after(delay: Duration) -> CancellationToken {
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            trigger.cancel();
        });
        stop
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_ramp_is_halfway_at_stage_midpoint() {
        let transport = Arc::new(Ok200(AtomicUsize::new(0)));
        let think = ThinkTime::new(100, 100).unwrap();
        let ctx = context(Arc::clone(&transport), 10, think, None);

        let report = RampScheduler::new(
            linear(0, &[(4, 4), (4, 2)], 1),
            ctx,
            Duration::from_millis(100),
        )
        .run(stop_after(Duration::from_secs(2)))
        .await;

        assert!(report.stopped_early);
        assert_eq!(report.peak_vus, 2);
        let ids: Vec<u64> = report.vus.iter().map(|r| r.state.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_ramp_starts_from_start_vus() {
        let transport = Arc::new(Ok200(AtomicUsize::new(0)));
        let think = ThinkTime::new(100, 100).unwrap();

        let early = RampScheduler::new(
            linear(2, &[(6, 4)], 1),
            context(Arc::clone(&transport), 10, think, None),
            Duration::from_millis(100),
        )
        .run(stop_after(Duration::from_millis(300)))
        .await;
        assert_eq!(early.peak_vus, 2);

        let later = RampScheduler::new(
            linear(2, &[(6, 4)], 1),
            context(Arc::clone(&transport), 10, think, None),
            Duration::from_millis(100),
        )
        .run(stop_after(Duration::from_secs(1)))
        .await;
        assert_eq!(later.peak_vus, 3);
        let ids: Vec<u64> = later.vus.iter().map(|r| r.state.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_stops_vus_stuck_in_backoff() {
        let transport = Arc::new(Unavailable(AtomicUsize::new(0)));
        let policy = RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_secs(60),
            jitter: false,
        };
        let ctx = context_with(
            Arc::clone(&transport) as Arc<dyn Transport>,
            policy,
            1,
            ThinkTime::none(),
            None,
        );

        let report = RampScheduler::new(plan(1, &[(1, 2)], 1), ctx, Duration::from_millis(100))
            .run(CancellationToken::new())
            .await;

        assert!(!report.stopped_early);
        assert_eq!(transport.0.load(Ordering::SeqCst), 1);
        assert_eq!(report.vus.len(), 1);
        assert_eq!(report.vus[0].exit, VuExit::Stopped);
        assert!(report.elapsed >= Duration::from_secs(3));
        assert!(report.elapsed < Duration::from_secs(60));
    }
}
