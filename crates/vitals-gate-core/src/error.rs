//! Error types for the audit execution engine
//!
//! Each component owns its error enum. [`Error`] wraps all of them for
//! callers that drive a whole run.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while resolving configuration profiles
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProfileError {
    #[error("Profile not found: {0}")]
    NotFound(String),

    #[error("Base profile '{base}' not found (referenced by '{profile}')")]
    BaseNotFound { base: String, profile: String },

    #[error("Circular profile inheritance: {}", chain.join(" -> "))]
    Cycle { chain: Vec<String> },

    #[error("Profile '{0}' settings must be a JSON object")]
    InvalidSettings(String),
}

/// Errors raised by the browser instance pool
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("No browser instances available after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("Failed to launch browser instance: {0}")]
    Launch(String),

    #[error("Pool size must be at least 1")]
    InvalidSize,
}

/// Errors raised by the process-isolated worker boundary
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Failed to spawn audit worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Audit worker timed out after {0:?}")]
    Timeout(Duration),

    #[error("Audit worker exited with {status}: {message}")]
    Exited { status: String, message: String },

    #[error("Audit worker reported failure: {0}")]
    Audit(String),

    #[error("Audit worker produced an unreadable result: {0}")]
    InvalidResult(String),

    #[error("Audit produced no usable metrics for {0}")]
    EmptyMetrics(String),

    #[error("Worker boundary has been shut down")]
    Shutdown,

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the task scheduler itself (never by a task handler)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("No task handler set")]
    NoHandler,

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler internal error: {0}")]
    Internal(String),
}

/// Errors raised while resolving authentication material
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing environment variables for auth: {}", .0.join(", "))]
    MissingVariables(Vec<String>),
}

/// Errors raised while scoring assertions
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("Metric '{metric}' has a non-finite {field} value")]
    NonFinite { metric: String, field: &'static str },
}

/// Errors raised while loading or validating run configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error for a run
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_chain() {
        let err = ProfileError::Cycle {
            chain: vec!["x".into(), "y".into(), "x".into()],
        };
        assert_eq!(err.to_string(), "Circular profile inheritance: x -> y -> x");
    }

    #[test]
    fn test_missing_variables_message() {
        let err = AuthError::MissingVariables(vec!["TOKEN".into(), "SESSION".into()]);
        assert_eq!(
            err.to_string(),
            "Missing environment variables for auth: TOKEN, SESSION"
        );
    }
}
