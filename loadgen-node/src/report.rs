//! Run summary and its renderings (JSON, plain text, JUnit XML)

use crate::config::OutputConfig;
use crate::error::Result;
use crate::metrics::{Aggregate, ProfileMetrics, HTTP_REQ_FAILED, ITERATIONS, VUS_MAX};
use crate::threshold::{ThresholdReport, ThresholdResult, ThresholdStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

/// Process exit status for a finished run
pub const EXIT_PASSED: i32 = 0;
pub const EXIT_THRESHOLDS_FAILED: i32 = 1;
pub const EXIT_CONFIGURATION: i32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub iterations: u64,
    pub requests: u64,
    pub failures: u64,
    pub retries: u64,
    pub vus_max: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

impl Totals {
    pub fn from_aggregates(names: &ProfileMetrics, aggregates: &BTreeMap<String, Aggregate>) -> Self {
        let count = |name: &str| match aggregates.get(name) {
            Some(Aggregate::Counter(c)) => c.count.max(0.0) as u64,
            _ => 0,
        };
        let (requests, failures) = match aggregates.get(&names.error_rate) {
            Some(Aggregate::Rate(r)) => (r.hits + r.misses, r.hits),
            _ => (0, 0),
        };
        let bytes = |name: &str| match aggregates.get(name) {
            Some(Aggregate::Trend(t)) => t.sum.max(0.0) as u64,
            _ => 0,
        };
        let vus_max = match aggregates.get(VUS_MAX) {
            Some(Aggregate::Gauge(g)) => g.max.max(0.0) as u64,
            _ => 0,
        };

        Self {
            iterations: count(ITERATIONS),
            requests,
            failures,
            retries: count(&names.retries),
            vus_max,
            bytes_sent: bytes(&names.req_bytes),
            bytes_received: bytes(&names.res_bytes),
        }
    }
}

/// Machine-readable result of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub profile: String,
    pub operations: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub stopped_early: bool,
    pub totals: Totals,
    pub metrics: BTreeMap<String, Aggregate>,
    pub thresholds: Vec<ThresholdResult>,
    pub passed: bool,
}

impl RunSummary {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        profile: &str,
        operations: &str,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        stopped_early: bool,
        names: &ProfileMetrics,
        metrics: BTreeMap<String, Aggregate>,
        thresholds: ThresholdReport,
    ) -> Self {
        let elapsed_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            profile: profile.to_string(),
            operations: operations.to_string(),
            started_at,
            finished_at,
            elapsed_ms,
            stopped_early,
            totals: Totals::from_aggregates(names, &metrics),
            passed: thresholds.passed(),
            metrics,
            thresholds: thresholds.results,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed {
            EXIT_PASSED
        } else {
            EXIT_THRESHOLDS_FAILED
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "profile={} operations={} elapsed={:.1}s iterations={} requests={} failures={} retries={} vus_max={} sent={}B received={}B",
            self.profile,
            self.operations,
            self.elapsed_ms as f64 / 1000.0,
            self.totals.iterations,
            self.totals.requests,
            self.totals.failures,
            self.totals.retries,
            self.totals.vus_max,
            self.totals.bytes_sent,
            self.totals.bytes_received,
        );

        for (name, aggregate) in &self.metrics {
            let line = match aggregate {
                Aggregate::Trend(t) => format!(
                    "avg={:.2} min={:.2} med={:.2} max={:.2} p(90)={:.2} p(95)={:.2} count={}",
                    t.avg, t.min, t.med, t.max, t.p90, t.p95, t.count
                ),
                Aggregate::Rate(r) => format!(
                    "{:.2}% {} of {}",
                    r.rate * 100.0,
                    r.hits,
                    r.hits + r.misses
                ),
                Aggregate::Counter(c) => format!("{}", c.count),
                Aggregate::Gauge(g) => format!("value={} max={}", g.value, g.max),
            };
            let _ = writeln!(out, "  {:.<40} {}", name, line);
        }

        if !self.thresholds.is_empty() {
            let _ = writeln!(out, "thresholds:");
            for t in &self.thresholds {
                let mark = match t.status {
                    ThresholdStatus::Passed => "ok",
                    ThresholdStatus::Failed => "FAIL",
                    ThresholdStatus::NoData => "no data",
                };
                let observed = t
                    .observed
                    .map(|v| format!("{:.3}", v))
                    .unwrap_or_else(|| "-".to_string());
                let _ = writeln!(
                    out,
                    "  [{}] {} {} (observed {})",
                    mark, t.metric, t.expression, observed
                );
            }
        }

        let _ = writeln!(out, "result: {}", if self.passed { "PASSED" } else { "FAILED" });
        out
    }

    /// One testcase per threshold
    pub fn render_junit(&self) -> String {
        let failures = self
            .thresholds
            .iter()
            .filter(|t| t.status == ThresholdStatus::Failed)
            .count();
        let skipped = self
            .thresholds
            .iter()
            .filter(|t| t.status == ThresholdStatus::NoData)
            .count();

        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            out,
            "<testsuites tests=\"{}\" failures=\"{}\" skipped=\"{}\">",
            self.thresholds.len(),
            failures,
            skipped
        );
        let _ = writeln!(
            out,
            "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" skipped=\"{}\" time=\"{:.3}\">",
            xml_escape(&format!("loadgen.{}", self.profile)),
            self.thresholds.len(),
            failures,
            skipped,
            self.elapsed_ms as f64 / 1000.0
        );
        for t in &self.thresholds {
            let name = xml_escape(&format!("{} {}", t.metric, t.expression));
            match t.status {
                ThresholdStatus::Passed => {
                    let _ = writeln!(out, "    <testcase name=\"{}\" classname=\"thresholds\"/>", name);
                }
                ThresholdStatus::NoData => {
                    let _ = writeln!(
                        out,
                        "    <testcase name=\"{}\" classname=\"thresholds\"><skipped message=\"no data\"/></testcase>",
                        name
                    );
                }
                ThresholdStatus::Failed => {
                    let message = match (&t.reason, t.observed) {
                        (Some(reason), _) => reason.clone(),
                        (None, Some(v)) => format!("observed {:.3}", v),
                        (None, None) => "failed".to_string(),
                    };
                    let _ = writeln!(
                        out,
                        "    <testcase name=\"{}\" classname=\"thresholds\"><failure message=\"{}\"/></testcase>",
                        name,
                        xml_escape(&message)
                    );
                }
            }
        }
        let _ = writeln!(out, "  </testsuite>");
        let _ = writeln!(out, "</testsuites>");
        out
    }

    /// Write every configured output, creating parent directories
    pub fn write_outputs(&self, output: &OutputConfig) -> Result<()> {
        if let Some(path) = &output.summary_json {
            write_file(Path::new(path), &self.to_json()?)?;
            info!(path = %path, "Summary written");
        }
        if let Some(path) = &output.summary_text {
            write_file(Path::new(path), &self.render_text())?;
        }
        if let Some(path) = &output.junit_xml {
            write_file(Path::new(path), &self.render_junit())?;
        }
        Ok(())
    }

    /// Final summary through tracing
    pub fn log(&self) {
        for line in self.render_text().lines() {
            info!("{}", line);
        }
        for failure in self.thresholds.iter().filter(|t| t.status == ThresholdStatus::Failed) {
            warn!(
                metric = %failure.metric,
                threshold = %failure.expression,
                observed = ?failure.observed,
                "Threshold crossed"
            );
        }
        let http_failed = self.metrics.get(HTTP_REQ_FAILED);
        info!(
            profile = %self.profile,
            passed = self.passed,
            requests = self.totals.requests,
            failures = self.totals.failures,
            http_req_failed = ?http_failed.map(|a| a.observations()),
            "Run complete"
        );
    }
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn xml_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            c => escaped.push(c),
        }
    }
    escaped
}
