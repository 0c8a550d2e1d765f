//! Run orchestration
//!
//! The runner expands the configuration into one [`Task`] per
//! (target, profile) pair, groups tasks by profile, and drains each group
//! through its own [`Scheduler`] before starting the next:
//!
//! ```text
//!   RunConfig ──expand──▶ group "desktop" ──Scheduler──▶ results ─┐
//!                         group "mobile"  ──Scheduler──▶ results ─┼─▶ RunSummary
//!                         ...             (sequential)            ─┘
//!
//!   per task:  resolve profile → merge + resolve auth → AuditEngine::audit
//!              → normalize metrics → assertions (baseline deltas)
//! ```
//!
//! Anything that goes wrong inside a task becomes a failed attempt the
//! scheduler may retry. Only a broken setup (unknown default profile,
//! invalid configuration) or scheduler misuse aborts the run.
//!
//! # Example
//!
//! ```no_run
//! use vitals_gate_core::{EventSink, RunConfig, Runner};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = RunConfig::from_file("vitals-gate.toml")?;
//! let runner = Runner::with_default_engine(config, EventSink::disabled())?;
//! let summary = runner.run().await?;
//!
//! for result in &summary.task_results {
//!     println!("{} [{}]: score {:?}", result.target, result.profile, result.metrics.score());
//! }
//! # Ok(())
//! # }
//! ```

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::assertions::{AssertionEvaluator, AssertionVerdict};
use crate::auth::AuthConfig;
use crate::baseline::BaselineIndex;
use crate::config::RunConfig;
use crate::error::{Error, WorkerError};
use crate::events::{EventSink, RunEvent};
use crate::metrics::{self, Metrics};
use crate::profiles::ProfileResolver;
use crate::report::JsonReporter;
use crate::scheduler::{handler_fn, Scheduler, SchedulerOptions};
use crate::task::{AuditResult, Task};
use crate::worker::{AuditEngine, AuditRequest, PooledWorkerEngine};

/// Aggregate outcome of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// RFC 3339
    pub start_time: String,
    /// RFC 3339
    pub end_time: String,
    pub duration_ms: u64,
    /// Logical tasks, retries not counted
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// The run was stopped before every task had a result
    #[serde(default)]
    pub stopped: bool,
    /// True only if there were tasks, all of them ran without failing, and
    /// every verdict passed
    pub passed: bool,
    /// One entry per logical task
    pub task_results: Vec<AuditResult>,
}

impl RunSummary {
    /// `total_tasks` is the number of tasks expanded for the run; tasks
    /// that never produced a result count against `passed`.
    fn from_results(
        start_time: String,
        started: Instant,
        total_tasks: usize,
        stopped: bool,
        task_results: Vec<AuditResult>,
    ) -> Self {
        let failed_tasks = task_results.iter().filter(|r| !r.is_success()).count();
        let completed_tasks = task_results.len() - failed_tasks;
        let verdicts_passed = task_results
            .iter()
            .filter_map(|r| r.verdict.as_ref())
            .all(|v| v.passed);
        let all_ran = !stopped && task_results.len() >= total_tasks;

        Self {
            start_time,
            end_time: Utc::now().to_rfc3339(),
            duration_ms: started.elapsed().as_millis() as u64,
            total_tasks,
            completed_tasks,
            failed_tasks,
            stopped,
            passed: total_tasks > 0 && all_ran && failed_tasks == 0 && verdicts_passed,
            task_results,
        }
    }

    /// Tasks that never produced a result
    pub fn skipped_tasks(&self) -> usize {
        self.total_tasks.saturating_sub(self.task_results.len())
    }

    /// Human-readable reasons the run failed
    pub fn failures(&self) -> Vec<String> {
        let mut failures = Vec::new();
        if self.total_tasks == 0 {
            failures.push("No tasks were run".to_string());
        }
        if self.stopped || self.skipped_tasks() > 0 {
            failures.push(format!(
                "Run stopped: {} of {} tasks never ran",
                self.skipped_tasks(),
                self.total_tasks
            ));
        }
        for result in &self.task_results {
            if let Some(error) = &result.error {
                failures.push(format!("{} [{}]: {}", result.target, result.profile, error));
            }
            if let Some(verdict) = result.verdict.as_ref().filter(|v| !v.passed) {
                for failure in verdict.failures() {
                    failures.push(format!("{} [{}]: {}", result.target, result.profile, failure));
                }
            }
        }
        failures
    }
}

/// Shared by every task handler invocation of a run
struct TaskContext {
    resolver: ProfileResolver,
    engine: Arc<dyn AuditEngine>,
    evaluator: Option<AssertionEvaluator>,
    baseline: Option<BaselineIndex>,
}

impl TaskContext {
    async fn audit(&self, task: Task) -> anyhow::Result<AuditResult> {
        let started = Instant::now();

        let profile = self.resolver.get_profile(&task.profile)?;
        let auth = AuthConfig::merge(profile.auth.as_ref(), task.target.auth.as_ref())
            .map(|auth| auth.resolve())
            .transpose()?;

        let request = AuditRequest {
            task_id: task.id.clone(),
            url: task.target.url.clone(),
            settings: profile.settings,
            auth,
        };
        let raw = self.engine.audit(request).await?;

        let metrics = metrics::normalize(&raw);
        if metrics.score().is_none() {
            return Err(WorkerError::EmptyMetrics(task.target.url.clone()).into());
        }

        let verdict = self.evaluate(&task, &metrics);
        let mut result = AuditResult::success(&task, metrics, Some(raw), started.elapsed().as_millis() as u64);
        result.verdict = verdict;
        Ok(result)
    }

    /// A verdict, or `None` when nothing is configured or scoring failed
    fn evaluate(&self, task: &Task, metrics: &Metrics) -> Option<AssertionVerdict> {
        let evaluator = self.evaluator.as_ref()?;
        let baseline = self
            .baseline
            .as_ref()
            .and_then(|b| b.lookup(&task.target.id, &task.target.url));

        match evaluator.verdict(&task.id, &task.target, metrics, baseline) {
            Ok(verdict) => {
                if !verdict.passed {
                    warn!(
                        "{} [{}]: {} assertion(s) failed",
                        task.target.id, task.profile, verdict.failure_count
                    );
                }
                Some(verdict)
            }
            Err(e) => {
                error!("Assertion evaluation failed for {}: {}", task.id, e);
                None
            }
        }
    }
}

/// Drives a whole run
pub struct Runner {
    config: RunConfig,
    engine: Arc<dyn AuditEngine>,
    events: EventSink,
    stopped: AtomicBool,
    current: Mutex<Option<Arc<Scheduler>>>,
}

impl Runner {
    pub fn new(config: RunConfig, engine: Arc<dyn AuditEngine>, events: EventSink) -> Self {
        Self {
            config,
            engine,
            events,
            stopped: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    /// A runner backed by the Chrome pool and the `audit-worker` binary
    pub fn with_default_engine(config: RunConfig, events: EventSink) -> Result<Self, Error> {
        let engine = PooledWorkerEngine::from_config(&config)?;
        Ok(Self::new(config, Arc::new(engine), events))
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Stop dispatching. Audits already started run to completion; the
    /// run then returns with the results gathered so far.
    pub fn stop(&self) {
        info!("Stopping run");
        self.stopped.store(true, Ordering::SeqCst);
        let current = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(scheduler) = current {
            scheduler.stop();
        }
    }

    /// Execute every task and aggregate the results.
    ///
    /// # Errors
    ///
    /// Invalid configuration, an unresolvable default profile, or a
    /// scheduler fault. Task failures never surface here; they are recorded
    /// in the summary.
    #[instrument(skip(self), fields(targets = self.config.targets.len()))]
    pub async fn run(&self) -> Result<RunSummary, Error> {
        let start_time = Utc::now().to_rfc3339();
        let started = Instant::now();
        self.stopped.store(false, Ordering::SeqCst);

        self.config.validate()?;
        let context = Arc::new(self.setup()?);
        let groups = self.expand(&context.resolver);
        let task_count: usize = groups.iter().map(|(_, tasks)| tasks.len()).sum();

        info!("Starting run: {} tasks in {} profile groups", task_count, groups.len());
        self.events.emit(RunEvent::RunStarted { task_count });

        let outcome = self.run_groups(groups, context).await;
        self.engine.cleanup().await;
        let task_results = outcome?;

        let stopped = self.stopped.load(Ordering::SeqCst);
        let summary = RunSummary::from_results(start_time, started, task_count, stopped, task_results);
        info!(
            "Run finished: {}/{} completed, {} failed, passed={} ({}ms)",
            summary.completed_tasks,
            summary.total_tasks,
            summary.failed_tasks,
            summary.passed,
            summary.duration_ms
        );

        self.write_output(&summary);
        self.events.emit(RunEvent::RunCompleted(Box::new(summary.clone())));
        Ok(summary)
    }

    /// Global setup; an error here aborts the run before any task exists
    fn setup(&self) -> Result<TaskContext, Error> {
        let resolver = ProfileResolver::new(self.config.profiles.clone());
        resolver.get_profile(&self.config.default_profile)?;

        for target in &self.config.targets {
            if let Some(profile) = &target.profile {
                if let Err(e) = resolver.get_profile(profile) {
                    warn!("Target '{}' will fail: {}", target.id, e);
                }
            }
        }

        let pool_size = self.config.effective_pool_size();
        if pool_size != self.config.concurrency {
            warn!(
                "concurrency ({}) and pool_size ({}) differ; at most {} audits run at once",
                self.config.concurrency,
                pool_size,
                self.config.concurrency.min(pool_size)
            );
        }

        let baseline = self.config.baseline.as_ref().and_then(|b| b.load());
        let evaluator = self.config.assertions.clone().map(AssertionEvaluator::new);

        Ok(TaskContext {
            resolver,
            engine: self.engine.clone(),
            evaluator,
            baseline,
        })
    }

    /// One task per target, grouped by profile in first-seen order
    fn expand(&self, resolver: &ProfileResolver) -> Vec<(String, Vec<Task>)> {
        let mut groups: Vec<(String, Vec<Task>)> = Vec::new();

        for target in &self.config.targets {
            let profile = target
                .profile
                .clone()
                .unwrap_or_else(|| self.config.default_profile.clone());
            debug!(
                "Target '{}' uses profile '{}' (registered: {})",
                target.id,
                profile,
                resolver.contains(&profile)
            );

            let task = Task::new(Arc::new(target.clone()), profile.clone());
            match groups.iter_mut().find(|(id, _)| *id == profile) {
                Some((_, tasks)) => tasks.push(task),
                None => groups.push((profile, vec![task])),
            }
        }

        groups
    }

    async fn run_groups(
        &self,
        groups: Vec<(String, Vec<Task>)>,
        context: Arc<TaskContext>,
    ) -> Result<Vec<AuditResult>, Error> {
        let mut results = Vec::new();

        for (profile, tasks) in groups {
            if self.stopped.load(Ordering::SeqCst) {
                info!("Run stopped; skipping profile '{}'", profile);
                break;
            }
            results.extend(self.run_group(&profile, tasks, context.clone()).await?);
        }

        Ok(results)
    }

    #[instrument(skip(self, tasks, context), fields(tasks = tasks.len()))]
    async fn run_group(
        &self,
        profile: &str,
        tasks: Vec<Task>,
        context: Arc<TaskContext>,
    ) -> Result<Vec<AuditResult>, Error> {
        info!("Starting profile '{}' ({} tasks)", profile, tasks.len());
        self.events.emit(RunEvent::ProfileStarted {
            profile: profile.to_string(),
            task_count: tasks.len(),
        });

        let mut scheduler = Scheduler::new(
            SchedulerOptions {
                concurrency: self.config.concurrency,
                max_retries: self.config.max_retries,
                timeout: Some(self.config.timeout),
            },
            self.events.clone(),
        );
        scheduler.set_handler(handler_fn(move |task| {
            let context = context.clone();
            async move { context.audit(task).await }
        }));
        scheduler.enqueue(tasks);

        let scheduler = Arc::new(scheduler);
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(scheduler.clone());
        if self.stopped.load(Ordering::SeqCst) {
            scheduler.stop();
        }

        let outcome = scheduler.run().await;
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        let results = outcome?;

        let failed = results.iter().filter(|r| !r.is_success()).count();
        info!(
            "Profile '{}' complete: {} succeeded, {} failed",
            profile,
            results.len() - failed,
            failed
        );
        self.events.emit(RunEvent::ProfileCompleted {
            profile: profile.to_string(),
        });
        Ok(results)
    }

    fn write_output(&self, summary: &RunSummary) {
        let Some(output) = &self.config.output else {
            return;
        };
        let Some(path) = &output.path else {
            return;
        };
        match JsonReporter::write_to_file(summary, path, output.pretty) {
            Ok(()) => info!("Wrote run summary to {}", path.display()),
            Err(e) => warn!("Failed to write run summary to {}: {:#}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertions::{AssertionsConfig, MetricThreshold};
    use crate::config::Target;
    use crate::profiles::Profile;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    /// Returns a lighthouse-shaped result and records every request
    #[derive(Default)]
    struct FakeEngine {
        requests: StdMutex<Vec<AuditRequest>>,
        fail_first: AtomicU32,
        scoreless: bool,
        delay: Option<std::time::Duration>,
        cleanups: AtomicU32,
    }

    #[async_trait]
    impl AuditEngine for FakeEngine {
        async fn audit(&self, request: AuditRequest) -> Result<Value, WorkerError> {
            self.requests.lock().unwrap().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(WorkerError::Audit("flaky".to_string()));
            }
            if self.scoreless {
                return Ok(json!({ "audits": {} }));
            }
            Ok(json!({
                "categories": { "performance": { "score": 0.93 } },
                "audits": {
                    "largest-contentful-paint": { "numericValue": 2200.0 },
                    "cumulative-layout-shift": { "numericValue": 0.02 }
                }
            }))
        }

        async fn cleanup(&self) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config(targets: Vec<Target>) -> RunConfig {
        let mut config = RunConfig::new(targets);
        config.max_retries = 0;
        config
    }

    fn two_targets() -> Vec<Target> {
        vec![
            Target::new("home", "https://example.com/"),
            Target::new("about", "https://example.com/about"),
        ]
    }

    #[tokio::test]
    async fn test_two_targets_pass() {
        let mut config = config(two_targets());
        config.concurrency = 2;
        let engine = Arc::new(FakeEngine::default());
        let runner = Runner::new(config, engine.clone(), EventSink::disabled());

        let summary = runner.run().await.unwrap();
        assert_eq!(summary.total_tasks, 2);
        assert_eq!(summary.completed_tasks, 2);
        assert_eq!(summary.failed_tasks, 0);
        assert!(summary.passed);
        assert_eq!(summary.task_results[0].metrics.score(), Some(93.0));
        assert_eq!(engine.cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_default_profile_aborts() {
        let mut config = config(two_targets());
        config.default_profile = "tablet".to_string();
        let engine = Arc::new(FakeEngine::default());
        let runner = Runner::new(config, engine.clone(), EventSink::disabled());

        assert!(matches!(runner.run().await, Err(Error::Profile(_))));
        assert!(engine.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_target_profile_fails_only_that_task() {
        let mut targets = two_targets();
        targets[1].profile = Some("tablet".to_string());
        let runner = Runner::new(config(targets), Arc::new(FakeEngine::default()), EventSink::disabled());

        let summary = runner.run().await.unwrap();
        assert_eq!(summary.total_tasks, 2);
        assert_eq!(summary.failed_tasks, 1);
        assert!(!summary.passed);
        let failed = summary.task_results.iter().find(|r| r.target == "about").unwrap();
        assert!(failed.error.as_deref().unwrap().contains("tablet"));
    }

    #[tokio::test]
    async fn test_scoreless_result_is_a_failure() {
        let engine = Arc::new(FakeEngine {
            scoreless: true,
            ..Default::default()
        });
        let runner = Runner::new(config(vec![Target::new("home", "https://example.com/")]), engine, EventSink::disabled());

        let summary = runner.run().await.unwrap();
        assert_eq!(summary.failed_tasks, 1);
        assert!(summary.task_results[0].metrics.is_empty());
    }

    #[tokio::test]
    async fn test_retry_collapses_to_one_result() {
        let mut config = config(vec![Target::new("home", "https://example.com/")]);
        config.max_retries = 2;
        let engine = Arc::new(FakeEngine {
            fail_first: AtomicU32::new(2),
            ..Default::default()
        });
        let runner = Runner::new(config, engine.clone(), EventSink::disabled());

        let summary = runner.run().await.unwrap();
        assert_eq!(summary.total_tasks, 1);
        assert!(summary.passed);
        assert_eq!(summary.task_results[0].attempt, 3);
        assert_eq!(engine.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_auth_merged_and_resolved() {
        let mut profile_auth = AuthConfig::default();
        profile_auth.headers.insert("X-Env".to_string(), "staging".to_string());
        profile_auth.headers.insert("Authorization".to_string(), "Basic profile".to_string());
        let mut target_auth = AuthConfig::default();
        target_auth.headers.insert("authorization".to_string(), "Bearer target".to_string());

        let mut profile = Profile::new("authed", json!({})).extending("desktop");
        profile.auth = Some(profile_auth);
        let mut target = Target::new("home", "https://example.com/");
        target.auth = Some(target_auth);

        let mut config = config(vec![target]);
        config.profiles = vec![profile];
        config.default_profile = "authed".to_string();
        let engine = Arc::new(FakeEngine::default());
        Runner::new(config, engine.clone(), EventSink::disabled()).run().await.unwrap();

        let requests = engine.requests.lock().unwrap();
        let auth = requests[0].auth.as_ref().unwrap();
        assert_eq!(auth.headers.get("X-Env").map(String::as_str), Some("staging"));
        assert_eq!(auth.headers.get("authorization").map(String::as_str), Some("Bearer target"));
        assert!(!auth.headers.contains_key("Authorization"));
        assert_eq!(requests[0].settings["formFactor"], "desktop");
    }

    #[tokio::test]
    async fn test_missing_auth_variable_fails_before_audit() {
        let mut auth = AuthConfig::default();
        auth.headers.insert(
            "Authorization".to_string(),
            "Bearer ${VITALS_GATE_TEST_UNSET_TOKEN_7F3A}".to_string(),
        );
        let mut target = Target::new("home", "https://example.com/");
        target.auth = Some(auth);
        let engine = Arc::new(FakeEngine::default());
        let runner = Runner::new(config(vec![target]), engine.clone(), EventSink::disabled());

        let summary = runner.run().await.unwrap();
        assert_eq!(summary.failed_tasks, 1);
        assert!(summary.task_results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("VITALS_GATE_TEST_UNSET_TOKEN_7F3A"));
        assert!(engine.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_assertion_fails_run() {
        let mut config = config(vec![Target::new("home", "https://example.com/")]);
        let mut assertions = AssertionsConfig::default();
        assertions.metrics.insert(metrics::LCP.to_string(), MetricThreshold::max(2000.0));
        config.assertions = Some(assertions);
        let runner = Runner::new(config, Arc::new(FakeEngine::default()), EventSink::disabled());

        let summary = runner.run().await.unwrap();
        assert_eq!(summary.failed_tasks, 0);
        assert!(!summary.passed);
        let verdict = summary.task_results[0].verdict.as_ref().unwrap();
        assert_eq!(verdict.failure_count, 1);
        assert_eq!(summary.failures().len(), 1);
    }

    #[tokio::test]
    async fn test_profile_groups_in_order() {
        let mut targets = two_targets();
        targets[0].profile = Some("mobile".to_string());
        targets.push(Target::new("blog", "https://example.com/blog"));
        let (events, mut rx) = EventSink::channel();
        let runner = Runner::new(config(targets), Arc::new(FakeEngine::default()), events);
        runner.run().await.unwrap();

        let mut order = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                RunEvent::ProfileStarted { profile, task_count } => order.push(format!("start {} {}", profile, task_count)),
                RunEvent::ProfileCompleted { profile } => order.push(format!("done {}", profile)),
                _ => {}
            }
        }
        assert_eq!(
            order,
            vec!["start mobile 1", "done mobile", "start desktop 2", "done desktop"]
        );
    }

    #[tokio::test]
    async fn test_stop_lets_in_flight_finish_and_skips_the_rest() {
        let mut targets = two_targets();
        targets.push(Target::new("blog", "https://example.com/blog"));
        targets[2].profile = Some("mobile".to_string());
        let engine = Arc::new(FakeEngine {
            delay: Some(std::time::Duration::from_millis(100)),
            ..Default::default()
        });
        let runner = Arc::new(Runner::new(config(targets), engine.clone(), EventSink::disabled()));

        let handle = tokio::spawn({
            let runner = runner.clone();
            async move { runner.run().await }
        });
        while engine.requests.lock().unwrap().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        runner.stop();

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.total_tasks, 3);
        assert_eq!(summary.task_results.len(), 1);
        assert_eq!(summary.task_results[0].target, "home");
        assert_eq!(summary.completed_tasks, 1);
        assert_eq!(summary.skipped_tasks(), 2);
        assert!(summary.stopped);
        assert!(!summary.passed);
        assert_eq!(
            summary.failures(),
            vec!["Run stopped: 2 of 3 tasks never ran".to_string()]
        );
        assert_eq!(engine.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_output_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let mut config = config(vec![Target::new("home", "https://example.com/")]);
        config.output = Some(crate::report::OutputConfig {
            path: Some(path.clone()),
            pretty: true,
        });
        let summary = Runner::new(config, Arc::new(FakeEngine::default()), EventSink::disabled())
            .run()
            .await
            .unwrap();

        let written: RunSummary = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written, summary);
    }
}
