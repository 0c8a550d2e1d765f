//! Assertion evaluation
//!
//! Thresholds are resolved per target in three layers, each deep-merged over
//! the previous one field by field:
//!
//! 1. global `metrics` thresholds
//! 2. `tags.<tag>` thresholds, in the order the tags appear on the target
//! 3. `targets.<id>` thresholds
//!
//! A resolved threshold may carry absolute bounds (`min`/`max`) and baseline
//! delta rules (`delta_max_pct`, `delta_min`, `delta_max_ms`). Each kind
//! produces its own result entry.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::Target;
use crate::error::EvaluationError;
use crate::metrics::Metrics;

/// Bounds and delta rules for one metric
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricThreshold {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    /// Fail if the change vs. baseline exceeds this percentage
    #[serde(default, alias = "deltaMaxPct", skip_serializing_if = "Option::is_none")]
    pub delta_max_pct: Option<f64>,
    /// Fail if the change vs. baseline is less than this value
    #[serde(default, alias = "deltaMin", skip_serializing_if = "Option::is_none")]
    pub delta_min: Option<f64>,
    /// Fail if the absolute increase vs. baseline exceeds this many ms
    #[serde(default, alias = "deltaMaxMs", skip_serializing_if = "Option::is_none")]
    pub delta_max_ms: Option<f64>,
}

impl MetricThreshold {
    pub fn max(max: f64) -> Self {
        Self {
            max: Some(max),
            ..Default::default()
        }
    }

    pub fn min(min: f64) -> Self {
        Self {
            min: Some(min),
            ..Default::default()
        }
    }

    /// Overwrite only the fields set in `other`
    pub fn merge(&mut self, other: &MetricThreshold) {
        if other.min.is_some() {
            self.min = other.min;
        }
        if other.max.is_some() {
            self.max = other.max;
        }
        if other.delta_max_pct.is_some() {
            self.delta_max_pct = other.delta_max_pct;
        }
        if other.delta_min.is_some() {
            self.delta_min = other.delta_min;
        }
        if other.delta_max_ms.is_some() {
            self.delta_max_ms = other.delta_max_ms;
        }
    }

    fn has_bounds(&self) -> bool {
        self.min.is_some() || self.max.is_some()
    }

    fn has_delta_rules(&self) -> bool {
        self.delta_max_pct.is_some() || self.delta_min.is_some() || self.delta_max_ms.is_some()
    }
}

/// Thresholds keyed by metric name
pub type Thresholds = BTreeMap<String, MetricThreshold>;

/// Assertion configuration for a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssertionsConfig {
    /// Thresholds applied to every target
    #[serde(default)]
    pub metrics: Thresholds,
    /// Overrides keyed by tag
    #[serde(default)]
    pub tags: BTreeMap<String, Thresholds>,
    /// Overrides keyed by target id
    #[serde(default)]
    pub targets: BTreeMap<String, Thresholds>,
}

/// Which check produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    Threshold,
    Delta,
}

/// Configured bounds echoed back in a result
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Expected {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// Change of a metric relative to its baseline
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub baseline: f64,
    pub change: f64,
    pub change_pct: f64,
}

impl Delta {
    /// Compute the change from `baseline` to `actual`.
    ///
    /// A zero baseline reports a 0% change.
    pub fn compute(actual: f64, baseline: f64) -> Self {
        let change = actual - baseline;
        let change_pct = if baseline != 0.0 {
            change / baseline * 100.0
        } else {
            0.0
        };
        Self {
            baseline,
            change,
            change_pct,
        }
    }
}

/// Outcome of one check on one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub metric: String,
    pub kind: AssertionKind,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual: Option<f64>,
    pub expected: Expected,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<Delta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// All assertion results for one completed audit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionVerdict {
    pub task_id: String,
    pub target: String,
    pub results: Vec<AssertionResult>,
    pub passed: bool,
    pub failure_count: usize,
}

impl AssertionVerdict {
    pub fn new(task_id: impl Into<String>, target: impl Into<String>, results: Vec<AssertionResult>) -> Self {
        let failure_count = results.iter().filter(|r| !r.passed).count();
        Self {
            task_id: task_id.into(),
            target: target.into(),
            passed: failure_count == 0,
            failure_count,
            results,
        }
    }

    /// One line per failed check
    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| {
                r.details
                    .clone()
                    .unwrap_or_else(|| format!("{} assertion failed", r.metric))
            })
            .collect()
    }
}

/// Resolves thresholds and evaluates metrics against them
#[derive(Debug, Clone, Default)]
pub struct AssertionEvaluator {
    config: AssertionsConfig,
}

impl AssertionEvaluator {
    pub fn new(config: AssertionsConfig) -> Self {
        Self { config }
    }

    /// Effective thresholds for `target`
    pub fn resolve(&self, target: &Target) -> Thresholds {
        let mut effective = self.config.metrics.clone();

        let layers = target
            .tags
            .iter()
            .filter_map(|tag| self.config.tags.get(tag))
            .chain(self.config.targets.get(&target.id));

        for layer in layers {
            for (metric, threshold) in layer {
                effective
                    .entry(metric.clone())
                    .or_default()
                    .merge(threshold);
            }
        }

        effective
    }

    /// Resolve thresholds for `target` and evaluate `metrics` into a verdict
    pub fn verdict(
        &self,
        task_id: &str,
        target: &Target,
        metrics: &Metrics,
        baseline: Option<&Metrics>,
    ) -> Result<AssertionVerdict, EvaluationError> {
        let thresholds = self.resolve(target);
        let results = Self::evaluate(metrics, &thresholds, baseline)?;
        Ok(AssertionVerdict::new(task_id, &target.id, results))
    }

    /// Evaluate absolute bounds and, when a baseline is given, delta rules.
    ///
    /// Metrics missing from either side are skipped, not failed.
    pub fn evaluate(
        metrics: &Metrics,
        thresholds: &Thresholds,
        baseline: Option<&Metrics>,
    ) -> Result<Vec<AssertionResult>, EvaluationError> {
        let mut results = Vec::new();

        for (metric, threshold) in thresholds {
            let Some(actual) = metrics.get(metric) else {
                continue;
            };
            if !actual.is_finite() {
                return Err(EvaluationError::NonFinite {
                    metric: metric.clone(),
                    field: "actual",
                });
            }

            if threshold.has_bounds() {
                results.push(Self::check_bounds(metric, actual, threshold));
            }

            if !threshold.has_delta_rules() {
                continue;
            }
            let Some(base) = baseline.and_then(|b| b.get(metric)) else {
                continue;
            };
            if !base.is_finite() {
                return Err(EvaluationError::NonFinite {
                    metric: metric.clone(),
                    field: "baseline",
                });
            }
            results.push(Self::check_delta(metric, actual, base, threshold));
        }

        Ok(results)
    }

    fn check_bounds(metric: &str, actual: f64, threshold: &MetricThreshold) -> AssertionResult {
        let mut problems = Vec::new();
        if let Some(min) = threshold.min {
            if actual < min {
                problems.push(format!("{} ({}) is below min ({})", metric, actual, min));
            }
        }
        if let Some(max) = threshold.max {
            if actual > max {
                problems.push(format!("{} ({}) exceeds max ({})", metric, actual, max));
            }
        }

        AssertionResult {
            metric: metric.to_string(),
            kind: AssertionKind::Threshold,
            passed: problems.is_empty(),
            actual: Some(actual),
            expected: Expected {
                min: threshold.min,
                max: threshold.max,
            },
            delta: None,
            details: (!problems.is_empty()).then(|| problems.join("; ")),
        }
    }

    fn check_delta(
        metric: &str,
        actual: f64,
        baseline: f64,
        threshold: &MetricThreshold,
    ) -> AssertionResult {
        let delta = Delta::compute(actual, baseline);
        let mut problems = Vec::new();

        if let Some(max_pct) = threshold.delta_max_pct {
            if delta.change_pct > max_pct {
                problems.push(format!(
                    "{} changed by {:.1}% vs baseline (max {}%)",
                    metric, delta.change_pct, max_pct
                ));
            }
        }
        if let Some(min_change) = threshold.delta_min {
            if delta.change < min_change {
                problems.push(format!(
                    "{} changed by {} vs baseline (required at least {})",
                    metric, delta.change, min_change
                ));
            }
        }
        if let Some(max_ms) = threshold.delta_max_ms {
            if delta.change > max_ms {
                problems.push(format!(
                    "{} increased by {}ms vs baseline (max {}ms)",
                    metric, delta.change, max_ms
                ));
            }
        }

        AssertionResult {
            metric: metric.to_string(),
            kind: AssertionKind::Delta,
            passed: problems.is_empty(),
            actual: Some(actual),
            expected: Expected::default(),
            delta: Some(delta),
            details: (!problems.is_empty()).then(|| problems.join("; ")),
        }
    }
}
