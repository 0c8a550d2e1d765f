//! Performance scoring and result shaping
//!
//! Each metric scores 1.0 at or below its "good" bound and 0.0 at or above
//! its "poor" bound, linearly in between. The overall score is the weighted
//! mean over the metrics that were measured.

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::collector::VitalsSnapshot;

/// Scoring curve for one metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricCurve {
    /// Engine audit id
    pub audit: &'static str,
    pub good: f64,
    pub poor: f64,
    pub weight: f64,
}

/// Scored metrics and their weights
pub const CURVES: &[MetricCurve] = &[
    MetricCurve { audit: "first-contentful-paint", good: 1800.0, poor: 3000.0, weight: 10.0 },
    MetricCurve { audit: "speed-index", good: 3400.0, poor: 5800.0, weight: 10.0 },
    MetricCurve { audit: "largest-contentful-paint", good: 2500.0, poor: 4000.0, weight: 25.0 },
    MetricCurve { audit: "total-blocking-time", good: 200.0, poor: 600.0, weight: 30.0 },
    MetricCurve { audit: "cumulative-layout-shift", good: 0.1, poor: 0.25, weight: 25.0 },
];

impl MetricCurve {
    pub fn score(&self, value: f64) -> f64 {
        if value <= self.good {
            1.0
        } else if value >= self.poor {
            0.0
        } else {
            (self.poor - value) / (self.poor - self.good)
        }
    }
}

/// Audit id and value for every metric in the snapshot
pub fn measured(snapshot: &VitalsSnapshot) -> Vec<(&'static str, f64)> {
    [
        ("first-contentful-paint", snapshot.fcp),
        ("largest-contentful-paint", snapshot.lcp),
        ("total-blocking-time", snapshot.tbt),
        ("cumulative-layout-shift", snapshot.cls),
        ("interactive", snapshot.tti),
        ("server-response-time", snapshot.ttfb),
    ]
    .into_iter()
    .filter_map(|(audit, value)| value.filter(|v| v.is_finite()).map(|v| (audit, v)))
    .collect()
}

/// Weighted score in 0..=1, renormalized over the measured metrics.
/// `None` when nothing scoreable was measured.
pub fn performance_score(values: &[(&str, f64)]) -> Option<f64> {
    let mut weighted = 0.0;
    let mut total_weight = 0.0;
    for curve in CURVES {
        if let Some((_, value)) = values.iter().find(|(audit, _)| *audit == curve.audit) {
            weighted += curve.score(*value) * curve.weight;
            total_weight += curve.weight;
        }
    }
    (total_weight > 0.0).then(|| weighted / total_weight)
}

fn display_value(audit: &str, value: f64) -> String {
    match audit {
        "cumulative-layout-shift" => format!("{:.3}", value),
        "total-blocking-time" | "server-response-time" => format!("{:.0} ms", value),
        _ => format!("{:.1} s", value / 1000.0),
    }
}

/// Build the engine result: named audits plus a performance category score
pub fn build_result(requested_url: &str, final_url: &str, settings: &Value, snapshot: &VitalsSnapshot) -> Value {
    let values = measured(snapshot);

    let mut audits = Map::new();
    for (audit, value) in &values {
        let score = CURVES
            .iter()
            .find(|c| c.audit == *audit)
            .map(|c| c.score(*value));
        audits.insert(
            audit.to_string(),
            json!({
                "id": audit,
                "numericValue": value,
                "displayValue": display_value(audit, *value),
                "score": score,
            }),
        );
    }

    json!({
        "requestedUrl": requested_url,
        "finalUrl": final_url,
        "fetchTime": Utc::now().to_rfc3339(),
        "configSettings": settings,
        "categories": {
            "performance": { "id": "performance", "score": performance_score(&values) }
        },
        "audits": audits,
    })
}
