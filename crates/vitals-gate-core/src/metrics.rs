//! Metric normalization
//!
//! The audit engine reports a result with named audit entries and a
//! performance category score. This module flattens that into [`Metrics`],
//! a map of short metric names to numbers, which is what assertions and
//! baselines operate on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Largest Contentful Paint (ms)
pub const LCP: &str = "lcp";
/// Cumulative Layout Shift (unitless)
pub const CLS: &str = "cls";
/// Total Blocking Time (ms)
pub const TBT: &str = "tbt";
/// First Contentful Paint (ms)
pub const FCP: &str = "fcp";
/// Time to Interactive (ms)
pub const TTI: &str = "tti";
/// Speed Index (ms)
pub const SI: &str = "si";
/// Server response time (ms)
pub const TTFB: &str = "ttfb";
/// Composite performance score (0-100)
pub const SCORE: &str = "score";

/// Engine audit ids and the metric each one maps to
pub const AUDIT_METRICS: &[(&str, &str)] = &[
    ("largest-contentful-paint", LCP),
    ("cumulative-layout-shift", CLS),
    ("total-blocking-time", TBT),
    ("first-contentful-paint", FCP),
    ("interactive", TTI),
    ("speed-index", SI),
    ("server-response-time", TTFB),
];

/// Normalized metrics for one audit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(BTreeMap<String, f64>);

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    pub fn score(&self) -> Option<f64> {
        self.get(SCORE)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl FromIterator<(String, f64)> for Metrics {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Metrics(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[(&str, f64); N]> for Metrics {
    fn from(pairs: [(&str, f64); N]) -> Self {
        pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }
}

/// Flatten a raw engine result into [`Metrics`].
///
/// Every field is optional; an audit that is missing or carries neither a
/// numeric nor a parseable display value is skipped. The composite score is
/// the performance category score scaled to 0-100.
pub fn normalize(raw: &Value) -> Metrics {
    let mut metrics = Metrics::new();

    if let Some(audits) = raw.get("audits") {
        for (audit_id, name) in AUDIT_METRICS {
            if let Some(value) = audits.get(*audit_id).and_then(audit_value) {
                metrics.insert(*name, value);
            }
        }
    }

    let score = raw
        .pointer("/categories/performance/score")
        .and_then(Value::as_f64)
        .filter(|s| s.is_finite());
    if let Some(score) = score {
        metrics.insert(SCORE, (score * 100.0).round());
    }

    metrics
}

fn audit_value(audit: &Value) -> Option<f64> {
    if let Some(n) = audit.get("numericValue").and_then(Value::as_f64) {
        if n.is_finite() {
            return Some(n);
        }
    }
    audit
        .get("displayValue")
        .and_then(Value::as_str)
        .and_then(parse_display_value)
}

/// Parse a human-readable value such as `"1.2 s"`, `"350 ms"` or `"0.05"`.
///
/// Seconds are converted to milliseconds; thousands separators are ignored.
pub fn parse_display_value(display: &str) -> Option<f64> {
    let cleaned: String = display
        .chars()
        .filter(|c| *c != ',' && *c != '\u{a0}')
        .collect();
    let cleaned = cleaned.trim();

    let number_end = cleaned
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .unwrap_or(cleaned.len());
    let value: f64 = cleaned[..number_end].parse().ok()?;
    let unit = cleaned[number_end..].trim();

    match unit {
        "" | "ms" => Some(value),
        "s" | "sec" => Some(value * 1000.0),
        _ => None,
    }
}
