//! Execution engine for web performance audits
//!
//! This crate runs Core Web Vitals audits for a set of URLs across device
//! and network profiles, and gates the outcome on thresholds and on
//! regressions against a stored baseline.
//!
//! # Features
//!
//! - **Bounded concurrency**: at most `concurrency` audits in flight, with
//!   per-attempt timeouts and FIFO retries
//! - **Browser pool**: a fixed number of Chrome instances shared by all audits
//! - **Process isolation**: every audit runs in its own `audit-worker` child
//!   process under a hard wall-clock limit
//! - **Inheritable profiles**: built-in `desktop`/`mobile` profiles plus custom
//!   ones that `extends` others, with cycle detection
//! - **Assertions**: global, per-tag and per-target thresholds and baseline
//!   deltas
//!
//! # Example
//!
//! ```no_run
//! use vitals_gate_core::{EventSink, RunConfig, Runner};
//! use vitals_gate_core::report::ConsoleReporter;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RunConfig::from_file("vitals-gate.toml")?;
//! let runner = Runner::with_default_engine(config, EventSink::disabled())?;
//! let summary = runner.run().await?;
//!
//! println!("{}", ConsoleReporter::format(&summary)?);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! ```toml
//! default_profile = "mobile"
//! concurrency = 2
//! max_retries = 1
//! timeout_ms = 90000
//!
//! [[targets]]
//! id = "home"
//! url = "https://myapp.com/"
//! tags = ["critical"]
//!
//! [[profiles]]
//! id = "mobile-4g"
//! extends = "mobile"
//! settings = { throttling = { rttMs = 60, throughputKbps = 9000 } }
//!
//! [assertions.metrics]
//! lcp = { max = 2500.0, delta_max_pct = 10.0 }
//! cls = { max = 0.1 }
//!
//! [assertions.tags.critical]
//! lcp = { max = 2000.0 }
//!
//! [baseline]
//! path = "baseline.json"
//!
//! [output]
//! path = "results/summary.json"
//! pretty = true
//! ```

pub mod assertions;
pub mod auth;
pub mod baseline;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod pool;
pub mod profiles;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod worker;

// Re-export main types for convenience
pub use assertions::{AssertionEvaluator, AssertionVerdict, AssertionsConfig, MetricThreshold};
pub use auth::AuthConfig;
pub use baseline::{Baseline, BaselineConfig, MatchBy};
pub use config::{RunConfig, Target};
pub use error::{Error, Result};
pub use events::{EventSink, RunEvent};
pub use metrics::Metrics;
pub use pool::{BrowserPool, ChromeLauncher, PoolOptions};
pub use profiles::{Profile, ProfileResolver};
pub use runner::{RunSummary, Runner};
pub use scheduler::{Scheduler, SchedulerOptions, TaskHandler};
pub use task::{AuditResult, Task};
pub use worker::{AuditEngine, AuditRequest, PooledWorkerEngine, WorkerBoundary, WorkerOptions, WorkerOutput};
