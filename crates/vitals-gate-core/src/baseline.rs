//! Baselines for regression (delta) assertions
//!
//! A baseline is a previous run's metrics per target, stored as JSON:
//!
//! ```json
//! { "version": 1, "generatedAt": "...", "targets": [
//!     { "id": "home", "url": "https://example.com/", "metrics": { "lcp": 2000 } }
//! ] }
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::metrics::Metrics;
use crate::runner::RunSummary;

/// Current baseline file version
pub const BASELINE_VERSION: u32 = 1;

/// Which target field baseline entries are matched on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchBy {
    #[default]
    Id,
    Url,
}

/// Baseline source for a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineConfig {
    /// JSON baseline file
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Baseline given directly in the configuration; wins over `path`
    #[serde(default)]
    pub inline: Option<Baseline>,
    /// Match key (default: id)
    #[serde(default)]
    pub match_by: MatchBy,
}

/// A stored set of per-target metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Baseline {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
    pub targets: Vec<BaselineTarget>,
}

/// Baseline metrics for one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineTarget {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub metrics: Metrics,
}

/// Baseline entries keyed by the configured match field
#[derive(Debug, Clone, Default)]
pub struct BaselineIndex {
    match_by: MatchBy,
    entries: HashMap<String, Metrics>,
}

impl BaselineIndex {
    /// Metrics for a target, looked up by id or url
    pub fn lookup(&self, id: &str, url: &str) -> Option<&Metrics> {
        match self.match_by {
            MatchBy::Id => self.entries.get(id),
            MatchBy::Url => self.entries.get(url),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Baseline {
    /// Load a baseline from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read baseline {}", path.display()))?;
        let baseline: Baseline = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse baseline {}", path.display()))?;
        Ok(baseline)
    }

    /// Build a baseline from the successful results of a run
    pub fn from_summary(summary: &RunSummary) -> Self {
        let targets = summary
            .task_results
            .iter()
            .filter(|r| r.error.is_none())
            .map(|r| BaselineTarget {
                id: r.target.clone(),
                url: r.url.clone(),
                metrics: r.metrics.clone(),
            })
            .collect();

        Self {
            version: BASELINE_VERSION,
            generated_at: Some(chrono::Utc::now().to_rfc3339()),
            targets,
        }
    }

    /// Write the baseline as pretty JSON
    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Index entries by id or url. Later duplicates win.
    pub fn index(&self, match_by: MatchBy) -> BaselineIndex {
        let entries = self
            .targets
            .iter()
            .map(|t| {
                let key = match match_by {
                    MatchBy::Id => t.id.clone(),
                    MatchBy::Url => t.url.clone(),
                };
                (key, t.metrics.clone())
            })
            .collect();
        BaselineIndex { match_by, entries }
    }
}

impl BaselineConfig {
    /// Load and index the configured baseline.
    ///
    /// Any failure is logged and yields `None`: a run without a usable
    /// baseline still runs, it just skips delta assertions.
    pub fn load(&self) -> Option<BaselineIndex> {
        let baseline = if let Some(inline) = &self.inline {
            inline.clone()
        } else if let Some(path) = &self.path {
            match Baseline::from_file(path) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Baseline unavailable, delta assertions skipped: {}", e);
                    return None;
                }
            }
        } else {
            warn!("Baseline configured without a path or inline data");
            return None;
        };

        if baseline.version != BASELINE_VERSION {
            warn!(
                "Baseline version {} differs from supported version {}",
                baseline.version, BASELINE_VERSION
            );
        }

        let index = baseline.index(self.match_by);
        debug!("Loaded baseline with {} entries", index.len());
        Some(index)
    }
}
