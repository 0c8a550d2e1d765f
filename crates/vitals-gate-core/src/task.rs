//! Tasks and their results
//!
//! A [`Task`] is one attempt at auditing a (target, profile) pair. Retries
//! are new `Task` values with the same logical key and a higher `attempt`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::assertions::AssertionVerdict;
use crate::config::Target;
use crate::metrics::Metrics;

/// One attempt to audit one target with one profile
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique across the run; shared by all attempts of a logical task
    pub id: String,
    pub target: Arc<Target>,
    pub profile: String,
    /// 1 for the first attempt
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create the first attempt for `target` under `profile`
    pub fn new(target: Arc<Target>, profile: impl Into<String>) -> Self {
        let profile = profile.into();
        let token = uuid::Uuid::new_v4().simple().to_string();
        Self {
            id: format!("{}:{}:{}", target.id, profile, &token[..8]),
            target,
            profile,
            attempt: 1,
            created_at: Utc::now(),
        }
    }

    /// The next attempt of the same logical task
    pub fn retry(&self) -> Self {
        Self {
            id: self.id.clone(),
            target: self.target.clone(),
            profile: self.profile.clone(),
            attempt: self.attempt + 1,
            created_at: Utc::now(),
        }
    }

    /// Identity shared by a task and all its retries
    pub fn logical_key(&self) -> (&str, &str) {
        (&self.target.id, &self.profile)
    }
}

/// Outcome of one task attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    pub task_id: String,
    /// Target id
    pub target: String,
    pub url: String,
    pub profile: String,
    pub attempt: u32,
    pub metrics: Metrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<Value>,
    pub duration_ms: u64,
    /// RFC 3339 completion time
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<AssertionVerdict>,
}

impl AuditResult {
    /// A successful result for `task`
    pub fn success(task: &Task, metrics: Metrics, raw_data: Option<Value>, duration_ms: u64) -> Self {
        Self {
            task_id: task.id.clone(),
            target: task.target.id.clone(),
            url: task.target.url.clone(),
            profile: task.profile.clone(),
            attempt: task.attempt,
            metrics,
            raw_data,
            duration_ms,
            timestamp: Utc::now().to_rfc3339(),
            error: None,
            verdict: None,
        }
    }

    /// A terminal failure: empty metrics and a non-empty error
    pub fn failure(task: &Task, error: impl Into<String>, duration_ms: u64) -> Self {
        let mut error = error.into();
        if error.is_empty() {
            error = "unknown error".to_string();
        }
        Self {
            error: Some(error),
            ..Self::success(task, Metrics::new(), None, duration_ms)
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// False when the task failed or an attached verdict failed
    pub fn passed(&self) -> bool {
        self.is_success() && self.verdict.as_ref().map_or(true, |v| v.passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(
            Arc::new(Target::new("home", "https://example.com/")),
            "desktop",
        )
    }

    #[test]
    fn test_task_ids_are_unique_per_logical_task() {
        let a = task();
        let b = task();
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("home:desktop:"));
        assert_eq!(a.logical_key(), b.logical_key());
    }

    #[test]
    fn test_retry_keeps_identity() {
        let first = task();
        let second = first.retry();
        assert_eq!(second.id, first.id);
        assert_eq!(second.attempt, 2);
        assert_eq!(second.retry().attempt, 3);
    }

    #[test]
    fn test_failure_has_error_and_no_metrics() {
        let result = AuditResult::failure(&task(), "", 10);
        assert!(result.metrics.is_empty());
        assert_eq!(result.error.as_deref(), Some("unknown error"));
        assert!(!result.passed());
    }
}
