//! Pass/fail thresholds over aggregated metrics
//!
//! Expressions follow the familiar `p(95)<2000` / `rate<0.05` form. They are
//! parsed when the run is prepared and evaluated exactly once after it stops.

use crate::error::{LoadgenError, Result};
use crate::metrics::Aggregate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

fn expression_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^\s*(avg|min|max|med|rate|count|p\(\s*([0-9]+(?:\.[0-9]+)?)\s*\))\s*(<=|>=|==|!=|<|>)\s*(-?[0-9]+(?:\.[0-9]+)?)\s*$",
        )
        .expect("threshold pattern is valid")
    })
}

/// Aggregate a threshold looks at
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statistic {
    Avg,
    Min,
    Max,
    Med,
    Percentile(f64),
    Rate,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparison {
    fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Comparison::Lt => observed < bound,
            Comparison::Le => observed <= bound,
            Comparison::Gt => observed > bound,
            Comparison::Ge => observed >= bound,
            Comparison::Eq => (observed - bound).abs() < f64::EPSILON,
            Comparison::Ne => (observed - bound).abs() >= f64::EPSILON,
        }
    }
}

/// One parsed predicate such as `p(95)<2000`
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdExpr {
    source: String,
    statistic: Statistic,
    comparison: Comparison,
    bound: f64,
}

impl ThresholdExpr {
    pub fn parse(source: &str) -> Result<Self> {
        let invalid = |reason: &str| LoadgenError::Threshold {
            expression: source.to_string(),
            reason: reason.to_string(),
        };

        let caps = expression_pattern()
            .captures(source)
            .ok_or_else(|| invalid("expected <aggregate><op><number>, e.g. p(95)<2000"))?;

        let statistic = match &caps[1] {
            "avg" => Statistic::Avg,
            "min" => Statistic::Min,
            "max" => Statistic::Max,
            "med" => Statistic::Med,
            "rate" => Statistic::Rate,
            "count" => Statistic::Count,
            _ => {
                let p: f64 = caps[2]
                    .parse()
                    .map_err(|_| invalid("percentile is not a number"))?;
                if !(0.0..=100.0).contains(&p) {
                    return Err(invalid("percentile must be within 0..=100"));
                }
                Statistic::Percentile(p)
            }
        };

        let comparison = match &caps[3] {
            "<" => Comparison::Lt,
            "<=" => Comparison::Le,
            ">" => Comparison::Gt,
            ">=" => Comparison::Ge,
            "==" => Comparison::Eq,
            _ => Comparison::Ne,
        };

        let bound: f64 = caps[4]
            .parse()
            .map_err(|_| invalid("bound is not a number"))?;

        Ok(Self {
            source: source.trim().to_string(),
            statistic,
            comparison,
            bound,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn statistic(&self) -> Statistic {
        self.statistic
    }

    /// Observed value for this expression, or why it does not apply
    fn observe(&self, aggregate: &Aggregate) -> std::result::Result<f64, String> {
        match (self.statistic, aggregate) {
            (Statistic::Avg, Aggregate::Trend(t)) => Ok(t.avg),
            (Statistic::Min, Aggregate::Trend(t)) => Ok(t.min),
            (Statistic::Max, Aggregate::Trend(t)) => Ok(t.max),
            (Statistic::Med, Aggregate::Trend(t)) => Ok(t.med),
            (Statistic::Percentile(p), Aggregate::Trend(t)) => Ok(t.percentile(p)),
            (Statistic::Count, Aggregate::Trend(t)) => Ok(t.count as f64),
            (Statistic::Rate, Aggregate::Rate(r)) => Ok(r.rate),
            (Statistic::Count, Aggregate::Rate(r)) => Ok((r.hits + r.misses) as f64),
            (Statistic::Count, Aggregate::Counter(c)) => Ok(c.count),
            (Statistic::Max, Aggregate::Gauge(g)) => Ok(g.max),
            (statistic, aggregate) => Err(format!(
                "{:?} does not apply to a {:?} metric",
                statistic,
                aggregate.kind()
            )),
        }
    }
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// All expressions configured for one metric
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdSpec {
    pub metric: String,
    pub expressions: Vec<ThresholdExpr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStatus {
    Passed,
    Failed,
    /// The metric recorded nothing; not counted as a failure
    NoData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdResult {
    pub metric: String,
    pub expression: String,
    pub observed: Option<f64>,
    pub status: ThresholdStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Outcome of evaluating every threshold once
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdReport {
    pub results: Vec<ThresholdResult>,
}

impl ThresholdReport {
    pub fn passed(&self) -> bool {
        self.results
            .iter()
            .all(|r| r.status != ThresholdStatus::Failed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results
            .iter()
            .filter(|r| r.status == ThresholdStatus::Failed)
    }
}

/// Thresholds keyed by metric name, in insertion order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdSet {
    specs: Vec<ThresholdSpec>,
}

impl ThresholdSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and add `expressions` for `metric`, merging with existing ones
    pub fn add<S: AsRef<str>>(&mut self, metric: &str, expressions: &[S]) -> Result<()> {
        let parsed = expressions
            .iter()
            .map(|e| ThresholdExpr::parse(e.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        match self.specs.iter_mut().find(|s| s.metric == metric) {
            Some(spec) => spec.expressions.extend(parsed),
            None => self.specs.push(ThresholdSpec {
                metric: metric.to_string(),
                expressions: parsed,
            }),
        }
        Ok(())
    }

    pub fn specs(&self) -> &[ThresholdSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn evaluate(&self, aggregates: &BTreeMap<String, Aggregate>) -> ThresholdReport {
        let mut results = Vec::new();

        for spec in &self.specs {
            let aggregate = aggregates
                .get(&spec.metric)
                .filter(|a| a.observations() > 0);

            for expr in &spec.expressions {
                let result = match aggregate {
                    None => ThresholdResult {
                        metric: spec.metric.clone(),
                        expression: expr.source.clone(),
                        observed: None,
                        status: ThresholdStatus::NoData,
                        reason: None,
                    },
                    Some(aggregate) => match expr.observe(aggregate) {
                        Ok(observed) => ThresholdResult {
                            metric: spec.metric.clone(),
                            expression: expr.source.clone(),
                            observed: Some(observed),
                            status: if expr.comparison.holds(observed, expr.bound) {
                                ThresholdStatus::Passed
                            } else {
                                ThresholdStatus::Failed
                            },
                            reason: None,
                        },
                        Err(reason) => ThresholdResult {
                            metric: spec.metric.clone(),
                            expression: expr.source.clone(),
                            observed: None,
                            status: ThresholdStatus::Failed,
                            reason: Some(reason),
                        },
                    },
                };
                results.push(result);
            }
        }

        ThresholdReport { results }
    }
}
