//! Client profiles and the catalog they are loaded from
//!
//! A profile is everything needed to load-test one retailer: dataset, row
//! filter, operations, token source, concurrency plan and think time. The
//! catalog is parsed once at start; resolved profiles are immutable and are
//! handed to the scheduler explicitly.

use crate::dataset::RowFilter;
use crate::error::{LoadgenError, Result};
use crate::payload::{PayloadBuilder, PayloadSpec};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Parse a duration such as `30s`, `2m`, `1m30s`, `1h` or `500ms`
pub fn parse_duration(input: &str) -> Result<Duration> {
    humantime::parse_duration(input.trim())
        .map_err(|e| LoadgenError::Config(format!("invalid duration '{}': {}", input, e)))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampMode {
    /// Each stage holds its target for the whole stage
    Step,
    /// Concurrency moves linearly from the previous level to the stage target,
    /// starting at `start_vus`
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stage {
    pub target: u32,
    pub duration: Duration,
}

/// Staged concurrency plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampPlan {
    pub start_vus: u32,
    pub stages: Vec<Stage>,
    pub graceful_ramp_down: Duration,
    pub mode: RampMode,
}

impl RampPlan {
    pub fn total_duration(&self) -> Duration {
        self.stages.iter().map(|s| s.duration).sum()
    }

    pub fn final_target(&self) -> u32 {
        self.stages.last().map_or(self.start_vus, |s| s.target)
    }

    pub fn max_vus(&self) -> u32 {
        self.stages
            .iter()
            .map(|s| s.target)
            .fold(self.start_vus, u32::max)
    }

    /// Index of the stage active at `elapsed`, or `None` once every stage ran
    pub fn stage_at(&self, elapsed: Duration) -> Option<usize> {
        let mut end = Duration::ZERO;
        for (index, stage) in self.stages.iter().enumerate() {
            end += stage.duration;
            if elapsed < end {
                return Some(index);
            }
        }
        None
    }

    /// Desired concurrency at `elapsed`, or `None` once every stage ran
    pub fn target_at(&self, elapsed: Duration) -> Option<u32> {
        let index = self.stage_at(elapsed)?;
        let stage = &self.stages[index];

        match self.mode {
            RampMode::Step => Some(stage.target),
            RampMode::Linear => {
                let stage_start: Duration = self.stages[..index].iter().map(|s| s.duration).sum();
                let from = if index == 0 {
                    self.start_vus
                } else {
                    self.stages[index - 1].target
                };
                let progress = (elapsed - stage_start).as_secs_f64() / stage.duration.as_secs_f64();
                let level = from as f64 + (stage.target as f64 - from as f64) * progress;
                Some(level.round().max(0.0) as u32)
            }
        }
    }

    /// Apply run-parameter overrides; the first stage is the ramp, the last the steady state
    pub fn apply_overrides(&mut self, overrides: &RampOverrides) -> Result<()> {
        if let Some(start) = overrides.start_vus {
            self.start_vus = start;
        }
        let last = self.stages.len().saturating_sub(1);
        if let Some(first) = self.stages.first_mut() {
            if let Some(target) = overrides.target_vus {
                first.target = target;
            }
            if let Some(d) = overrides.ramp_duration.as_deref() {
                first.duration = parse_duration(d)?;
            }
        }
        if last > 0 {
            let steady = &mut self.stages[last];
            if let Some(target) = overrides.steady_vus.or(overrides.target_vus) {
                steady.target = target;
            }
            if let Some(d) = overrides.steady_duration.as_deref() {
                steady.duration = parse_duration(d)?;
            }
        }
        Ok(())
    }
}

/// Optional ramp overrides taken from run parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RampOverrides {
    pub start_vus: Option<u32>,
    pub target_vus: Option<u32>,
    pub steady_vus: Option<u32>,
    pub ramp_duration: Option<String>,
    pub steady_duration: Option<String>,
}

/// Think-time bounds between iterations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkTime {
    pub min: Duration,
    pub max: Duration,
}

impl Default for ThinkTime {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(500),
            max: Duration::from_millis(1500),
        }
    }
}

impl ThinkTime {
    pub fn new(min_ms: u64, max_ms: u64) -> Result<Self> {
        if min_ms > max_ms {
            return Err(LoadgenError::Config(format!(
                "think time min {}ms exceeds max {}ms",
                min_ms, max_ms
            )));
        }
        Ok(Self {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        })
    }

    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    /// Uniform draw from `[min, max]`
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        if max <= min {
            return self.min;
        }
        Duration::from_millis(rng.gen_range(min..=max))
    }
}

/// Which operations of a profile run each iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationSelection {
    All,
    Only(String),
}

impl OperationSelection {
    pub fn parse(raw: &str) -> Self {
        let key = raw.trim().to_lowercase();
        match key.as_str() {
            "" | "all" | "both" => OperationSelection::All,
            _ => OperationSelection::Only(key),
        }
    }

    pub fn includes(&self, key: &str) -> bool {
        match self {
            OperationSelection::All => true,
            OperationSelection::Only(only) => only.eq_ignore_ascii_case(key),
        }
    }
}

impl fmt::Display for OperationSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationSelection::All => f.write_str("all"),
            OperationSelection::Only(key) => f.write_str(key),
        }
    }
}

/// One named HTTP call within a profile
#[derive(Clone)]
pub struct Operation {
    pub key: String,
    pub method: String,
    pub url: String,
    pub content_type: String,
    pub extra_headers: BTreeMap<String, String>,
    pub payload: Arc<dyn PayloadBuilder>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("key", &self.key)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("content_type", &self.content_type)
            .field("extra_headers", &self.extra_headers)
            .field("payload", &self.payload.kind())
            .finish()
    }
}

impl Operation {
    pub fn post(key: &str, url: &str, payload: Arc<dyn PayloadBuilder>) -> Self {
        Self {
            key: key.to_string(),
            method: "POST".to_string(),
            url: url.to_string(),
            content_type: "application/json".to_string(),
            extra_headers: BTreeMap::new(),
            payload,
        }
    }
}

/// Resolved, immutable profile for one target system
#[derive(Debug, Clone)]
pub struct ClientProfile {
    pub key: String,
    /// Metric name prefix
    pub name: String,
    pub token_env: String,
    pub dataset: PathBuf,
    pub row_filter: RowFilter,
    pub extra_headers: BTreeMap<String, String>,
    pub operations: Vec<Operation>,
    pub ramp: RampPlan,
    pub think: ThinkTime,
}

impl ClientProfile {
    pub fn operation(&self, key: &str) -> Option<&Operation> {
        self.operations
            .iter()
            .find(|op| op.key.eq_ignore_ascii_case(key))
    }

    /// Operations picked by `selection`, in declared order
    pub fn select(&self, selection: &OperationSelection) -> Result<Vec<Operation>> {
        let selected: Vec<Operation> = self
            .operations
            .iter()
            .filter(|op| selection.includes(&op.key))
            .cloned()
            .collect();

        if selected.is_empty() {
            return Err(LoadgenError::Config(format!(
                "profile '{}' has no operation '{}'",
                self.key, selection
            )));
        }
        Ok(selected)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "profile")]
    profiles: Vec<ProfileDef>,
}

#[derive(Debug, Deserialize)]
struct ProfileDef {
    key: String,
    name: String,
    token_env: String,
    dataset: String,
    #[serde(default)]
    required_columns: Vec<String>,
    #[serde(default)]
    extra_headers: BTreeMap<String, String>,
    #[serde(default)]
    think: ThinkDef,
    ramp: RampDef,
    #[serde(default, rename = "operation")]
    operations: Vec<OperationDef>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ThinkDef {
    min_ms: u64,
    max_ms: u64,
}

impl Default for ThinkDef {
    fn default() -> Self {
        Self {
            min_ms: 500,
            max_ms: 1500,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RampDef {
    start_vus: u32,
    stages: Vec<StageDef>,
    #[serde(default = "default_graceful_ramp_down")]
    graceful_ramp_down: String,
    #[serde(default)]
    mode: RampMode,
}

fn default_graceful_ramp_down() -> String {
    "30s".to_string()
}

#[derive(Debug, Deserialize)]
struct StageDef {
    target: u32,
    duration: String,
}

#[derive(Debug, Deserialize)]
struct OperationDef {
    key: String,
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default = "default_content_type")]
    content_type: String,
    #[serde(default)]
    extra_headers: BTreeMap<String, String>,
    payload: PayloadSpec,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_content_type() -> String {
    "application/json".to_string()
}

impl ProfileDef {
    fn resolve(self, base_dir: &Path) -> Result<ClientProfile> {
        let key = self.key.trim().to_lowercase();
        let context = |msg: String| LoadgenError::Config(format!("profile '{}': {}", key, msg));

        if self.operations.is_empty() {
            return Err(context("declares no operations".to_string()));
        }
        if self.ramp.stages.is_empty() {
            return Err(context("ramp declares no stages".to_string()));
        }

        let mut seen = HashSet::new();
        let mut operations = Vec::with_capacity(self.operations.len());
        for op in self.operations {
            let op_key = op.key.trim().to_lowercase();
            if !seen.insert(op_key.clone()) {
                return Err(context(format!("duplicate operation '{}'", op_key)));
            }
            operations.push(Operation {
                key: op_key,
                method: op.method.to_uppercase(),
                url: op.url,
                content_type: op.content_type,
                extra_headers: op.extra_headers,
                payload: op.payload.into_builder(),
            });
        }

        let stages = self
            .ramp
            .stages
            .iter()
            .map(|s| {
                Ok(Stage {
                    target: s.target,
                    duration: parse_duration(&s.duration)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let row_filter = if self.required_columns.is_empty() {
            RowFilter::NonEmpty
        } else {
            RowFilter::RequiredColumns(self.required_columns)
        };

        Ok(ClientProfile {
            key,
            name: self.name,
            token_env: self.token_env,
            dataset: base_dir.join(self.dataset),
            row_filter,
            extra_headers: self.extra_headers,
            operations,
            ramp: RampPlan {
                start_vus: self.ramp.start_vus,
                stages,
                graceful_ramp_down: parse_duration(&self.ramp.graceful_ramp_down)?,
                mode: self.ramp.mode,
            },
            think: ThinkTime::new(self.think.min_ms, self.think.max_ms)?,
        })
    }
}

/// Explicit profile catalog keyed by lower-case profile key
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: BTreeMap<String, Arc<ClientProfile>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog file; dataset paths resolve against its directory
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LoadgenError::Config(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&content, base_dir)
    }

    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self> {
        let catalog: CatalogFile = toml::from_str(content)?;
        let mut registry = Self::new();
        for def in catalog.profiles {
            registry.insert(def.resolve(base_dir)?)?;
        }
        debug!(profiles = registry.len(), "Profile catalog loaded");
        Ok(registry)
    }

    pub fn insert(&mut self, profile: ClientProfile) -> Result<()> {
        let key = profile.key.to_lowercase();
        if self.profiles.contains_key(&key) {
            return Err(LoadgenError::Config(format!("duplicate profile '{}'", key)));
        }
        self.profiles.insert(key, Arc::new(profile));
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Result<Arc<ClientProfile>> {
        self.profiles
            .get(&key.trim().to_lowercase())
            .cloned()
            .ok_or_else(|| LoadgenError::UnknownProfile(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
