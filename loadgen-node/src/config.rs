//! Run configuration
//!
//! `LoadgenConfig` is read from a TOML file, then layered with `LOADGEN_`
//! environment variables (`LOADGEN_RETRY__TRIES=6`) and the short run
//! parameters (`CLIENT`, `OP`, `RAMP_TARGET_VUS`, ...). `validate` rejects settings
//! that would make a run meaningless before any VU starts.

use crate::error::{LoadgenError, Result};
use crate::metrics::{ProfileMetrics, HTTP_REQ_FAILED};
use crate::profile::{OperationSelection, RampOverrides, ThinkTime};
use crate::retry::RetryPolicy;
use crate::threshold::ThresholdSet;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Run configuration for the load generator
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadgenConfig {
    /// Profile selection and run control
    pub run: RunConfig,
    /// Retry policy for every operation
    pub retry: RetryConfig,
    /// HTTP client settings
    pub http: HttpConfig,
    /// Think-time override applied on top of the profile
    pub think: ThinkConfig,
    /// Ramp overrides applied on top of the profile
    pub ramp: RampOverrides,
    /// Pass/fail thresholds
    pub thresholds: ThresholdsConfig,
    /// Prometheus exporter
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Summary outputs
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Profile key in the catalog
    pub profile: String,
    /// `all` or a single operation key
    pub operation: String,
    /// Profile catalog path
    pub catalog: String,
    /// Hard stop for the whole run, in seconds
    pub deadline_secs: Option<u64>,
    /// Scheduler re-evaluation interval
    pub tick_ms: u64,
    /// Stop each VU after this many iterations
    pub iterations_per_vu: Option<u64>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            profile: "local".to_string(),
            operation: "all".to_string(),
            catalog: "config/profiles.toml".to_string(),
            deadline_secs: None,
            tick_ms: 250,
            iterations_per_vu: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub tries: u32,
    pub base_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            tries: 4,
            base_ms: 250,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout, independent of the run deadline
    pub timeout_ms: u64,
    pub max_redirects: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_redirects: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinkConfig {
    pub min_ms: Option<u64>,
    pub max_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdsConfig {
    /// Bound for `rate` on http_req_failed
    pub error_rate: f64,
    /// p95 bound in ms for the per-profile duration
    pub profile_p95_ms: f64,
    /// p95 bound in ms for every per-operation duration
    pub operation_p95_ms: f64,
    pub custom: Vec<CustomThreshold>,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            error_rate: 0.05,
            profile_p95_ms: 2000.0,
            operation_p95_ms: 200.0,
            custom: Vec::new(),
        }
    }
}

/// Extra expressions for an arbitrary metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomThreshold {
    pub metric: String,
    pub expressions: Vec<String>,
}

impl ThresholdsConfig {
    /// Default thresholds for a profile and its selected operations, plus custom ones
    pub fn build<'a>(
        &self,
        names: &ProfileMetrics,
        operations: impl IntoIterator<Item = &'a str>,
    ) -> Result<ThresholdSet> {
        let mut set = ThresholdSet::new();
        set.add(HTTP_REQ_FAILED, &[format!("rate<{}", self.error_rate)])?;
        set.add(
            &names.req_duration,
            &[format!("p(95)<{}", self.profile_p95_ms)],
        )?;
        for op in operations {
            set.add(
                &names.operation_duration(op),
                &[format!("p(95)<{}", self.operation_p95_ms)],
            )?;
        }
        for custom in &self.custom {
            set.add(&custom.metric, &custom.expressions)?;
        }
        Ok(set)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: "127.0.0.1:9464".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is unset
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "loadgen_node=info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub summary_json: Option<String>,
    pub summary_text: Option<String>,
    pub junit_xml: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            summary_json: Some("results/summary.json".to_string()),
            summary_text: None,
            junit_xml: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| LoadgenError::Config(format!("Invalid {}: {}", name, e)))
}

impl LoadgenConfig {
    /// Load configuration from file, layered with `LOADGEN_<SECTION>__<KEY>` environment variables
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("LOADGEN")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Apply the short run parameters (`CLIENT`, `OP`, `RETRY_TRIES`, ...) from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply run parameters from any lookup; blank values are ignored
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut applied = 0usize;

        if let Some(client) = get("CLIENT") {
            self.run.profile = client.trim().to_lowercase();
            applied += 1;
        }
        if let Some(op) = get("OP") {
            self.run.operation = op.trim().to_lowercase();
            applied += 1;
        }
        if let Some(v) = get("RETRY_TRIES") {
            self.retry.tries = parse_var("RETRY_TRIES", &v)?;
            applied += 1;
        }
        if let Some(v) = get("RETRY_BASE_MS") {
            self.retry.base_ms = parse_var("RETRY_BASE_MS", &v)?;
            applied += 1;
        }
        if let Some(v) = get("RAMP_START_VUS") {
            self.ramp.start_vus = Some(parse_var("RAMP_START_VUS", &v)?);
            applied += 1;
        }
        if let Some(v) = get("RAMP_TARGET_VUS") {
            self.ramp.target_vus = Some(parse_var("RAMP_TARGET_VUS", &v)?);
            applied += 1;
        }
        if let Some(v) = get("STEADY_VUS") {
            self.ramp.steady_vus = Some(parse_var("STEADY_VUS", &v)?);
            applied += 1;
        }
        if let Some(v) = get("RAMP_DURATION") {
            crate::profile::parse_duration(&v)?;
            self.ramp.ramp_duration = Some(v.trim().to_string());
            applied += 1;
        }
        if let Some(v) = get("STEADY_DURATION") {
            crate::profile::parse_duration(&v)?;
            self.ramp.steady_duration = Some(v.trim().to_string());
            applied += 1;
        }
        if let Some(v) = get("SLEEP_MIN_MS") {
            self.think.min_ms = Some(parse_var("SLEEP_MIN_MS", &v)?);
            applied += 1;
        }
        if let Some(v) = get("SLEEP_MAX_MS") {
            self.think.max_ms = Some(parse_var("SLEEP_MAX_MS", &v)?);
            applied += 1;
        }
        if let Some(v) = get("OP_P95_MS") {
            self.thresholds.operation_p95_ms = parse_var("OP_P95_MS", &v)?;
            applied += 1;
        }
        if let Some(v) = get("TIMEOUT_MS") {
            self.http.timeout_ms = parse_var("TIMEOUT_MS", &v)?;
            applied += 1;
        }

        if applied > 0 {
            info!(count = applied, "Applied run parameter overrides");
        }
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.run.profile.trim().is_empty() {
            return Err(LoadgenError::Config("Profile name cannot be empty".to_string()));
        }

        if self.retry.tries == 0 {
            return Err(LoadgenError::Config("Retry tries must be at least 1".to_string()));
        }

        if self.http.timeout_ms == 0 {
            return Err(LoadgenError::Config("HTTP timeout cannot be 0".to_string()));
        }

        if self.run.tick_ms == 0 {
            return Err(LoadgenError::Config("Scheduler tick cannot be 0".to_string()));
        }

        if let (Some(min), Some(max)) = (self.think.min_ms, self.think.max_ms) {
            if min > max {
                return Err(LoadgenError::Config(format!(
                    "Think time min {}ms exceeds max {}ms",
                    min, max
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.thresholds.error_rate) {
            return Err(LoadgenError::Config(
                "Error rate threshold must be within 0..=1".to_string(),
            ));
        }

        if self.metrics.enabled {
            self.metrics_addr()?;
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(LoadgenError::Config(format!(
                    "Unknown log format '{}'",
                    other
                )))
            }
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.tries,
            base_backoff: Duration::from_millis(self.retry.base_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http.timeout_ms)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.run.tick_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.run.deadline_secs.map(Duration::from_secs)
    }

    pub fn selection(&self) -> OperationSelection {
        OperationSelection::parse(&self.run.operation)
    }

    pub fn catalog_path(&self) -> PathBuf {
        PathBuf::from(&self.run.catalog)
    }

    /// Think time with any configured bound replacing the profile's
    pub fn think_time(&self, profile: ThinkTime) -> Result<ThinkTime> {
        let min = self
            .think
            .min_ms
            .unwrap_or(profile.min.as_millis() as u64);
        let max = self
            .think
            .max_ms
            .unwrap_or(profile.max.as_millis() as u64);
        ThinkTime::new(min, max)
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        self.metrics.listen_addr.parse().map_err(|e| {
            LoadgenError::Config(format!(
                "Invalid metrics listen address '{}': {}",
                self.metrics.listen_addr, e
            ))
        })
    }
}
