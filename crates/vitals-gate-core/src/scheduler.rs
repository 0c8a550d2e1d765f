//! Bounded-concurrency task scheduler
//!
//! The scheduler owns a FIFO queue of [`Task`]s and dispatches them to an
//! injected [`TaskHandler`], keeping at most `concurrency` handler calls in
//! flight. A failed or timed-out attempt is re-queued at the back with
//! `attempt + 1` until `max_retries` is exhausted, after which a terminal
//! failed [`AuditResult`] is recorded.
//!
//! ```text
//!   enqueue ──▶ [ queue (FIFO) ] ──dispatch──▶ in flight (≤ C) ──▶ handler
//!                     ▲                               │
//!                     └──── retry (attempt + 1) ◀─────┤ failure / timeout
//!                                                     ▼
//!                                                  results
//! ```
//!
//! Handler errors and panics are contained per task. Only scheduler misuse
//! (no handler, concurrent `run`) or an internal fault escapes `run`.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::error::SchedulerError;
use crate::events::{EventSink, RunEvent};
use crate::task::{AuditResult, Task};

/// Executes a single task attempt
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: Task) -> anyhow::Result<AuditResult>;
}

/// Adapter turning an async closure into a [`TaskHandler`]
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<AuditResult>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(Task) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<AuditResult>> + Send + 'static,
{
    async fn handle(&self, task: Task) -> anyhow::Result<AuditResult> {
        (self.0)(task).await
    }
}

/// Limits applied by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Maximum handler calls in flight (at least 1)
    pub concurrency: usize,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Per-attempt watchdog
    pub timeout: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_retries: 0,
            timeout: None,
        }
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: VecDeque<Task>,
    active: HashMap<String, Task>,
}

/// Outcome of one dispatched attempt
struct Attempt {
    task: Task,
    started: Instant,
    outcome: Result<AuditResult, String>,
}

/// Clears the running flag when `run` returns by any path
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The scheduler
pub struct Scheduler {
    options: SchedulerOptions,
    handler: Option<Arc<dyn TaskHandler>>,
    state: Mutex<SchedulerState>,
    running: AtomicBool,
    stopped: AtomicBool,
    events: EventSink,
}

impl Scheduler {
    pub fn new(options: SchedulerOptions, events: EventSink) -> Self {
        Self {
            options: SchedulerOptions {
                concurrency: options.concurrency.max(1),
                ..options
            },
            handler: None,
            state: Mutex::new(SchedulerState::default()),
            running: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            events,
        }
    }

    pub fn options(&self) -> SchedulerOptions {
        self.options
    }

    pub fn set_handler(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handler = Some(handler);
    }

    /// Append tasks to the back of the queue
    pub fn enqueue(&self, tasks: impl IntoIterator<Item = Task>) {
        let mut state = self.lock_state();
        state.queue.extend(tasks);
    }

    /// Tasks waiting to be dispatched
    pub fn queued(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Tasks whose handler call is in flight
    pub fn in_flight(&self) -> usize {
        self.lock_state().active.len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drop all queued tasks and stop dispatching.
    ///
    /// Handler calls already in flight are not interrupted; their failures
    /// are recorded as terminal instead of being retried.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut state = self.lock_state();
        let dropped = state.queue.len();
        state.queue.clear();
        state.active.clear();
        info!("Scheduler stopped ({} queued tasks dropped)", dropped);
    }

    /// Drain the queue, returning one terminal result per logical task.
    ///
    /// # Errors
    ///
    /// Returns an error if no handler is set, if the scheduler is already
    /// running, or if an in-flight attempt is lost in a way that cannot be
    /// attributed to a task.
    #[instrument(skip(self), fields(concurrency = self.options.concurrency))]
    pub async fn run(&self) -> Result<Vec<AuditResult>, SchedulerError> {
        let handler = self.handler.clone().ok_or(SchedulerError::NoHandler)?;
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SchedulerError::AlreadyRunning);
        }
        let _running = RunningGuard(&self.running);
        self.stopped.store(false, Ordering::SeqCst);

        let mut in_flight: JoinSet<Attempt> = JoinSet::new();
        let mut results = Vec::new();

        loop {
            while in_flight.len() < self.options.concurrency && !self.is_stopped() {
                let Some(task) = self.next_task() else {
                    break;
                };
                self.dispatch(&mut in_flight, handler.clone(), task);
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let attempt = joined.map_err(|e| {
                SchedulerError::Internal(format!("in-flight attempt lost: {}", e))
            })?;
            self.lock_state().active.remove(&attempt.task.id);
            self.settle(attempt, &mut results);
        }

        debug!("Scheduler drained with {} results", results.len());
        self.events.emit(RunEvent::QueueDrained {
            results: results.len(),
        });
        Ok(results)
    }

    fn dispatch(&self, in_flight: &mut JoinSet<Attempt>, handler: Arc<dyn TaskHandler>, task: Task) {
        debug!(task = %task.id, attempt = task.attempt, "Dispatching task");
        self.lock_state()
            .active
            .insert(task.id.clone(), task.clone());
        self.events.emit(RunEvent::TaskStarted(task.clone()));

        let timeout = self.options.timeout;
        in_flight.spawn(async move {
            let started = Instant::now();
            let call = AssertUnwindSafe(handler.handle(task.clone())).catch_unwind();

            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => flatten(result),
                    Err(_) => Err(format!("Task timed out after {}ms", limit.as_millis())),
                },
                None => flatten(call.await),
            };

            Attempt {
                task,
                started,
                outcome,
            }
        });
    }

    fn settle(&self, attempt: Attempt, results: &mut Vec<AuditResult>) {
        let Attempt {
            task,
            started,
            outcome,
        } = attempt;

        match outcome {
            Ok(result) => {
                debug!(task = %task.id, attempt = task.attempt, "Task completed");
                self.events.emit(RunEvent::TaskCompleted(result.clone()));
                results.push(result);
            }
            Err(error) => {
                let will_retry = task.attempt <= self.options.max_retries && !self.is_stopped();
                warn!(
                    task = %task.id,
                    attempt = task.attempt,
                    will_retry,
                    "Task failed: {}",
                    error
                );
                self.events.emit(RunEvent::TaskFailed {
                    task: task.clone(),
                    error: error.clone(),
                    will_retry,
                });

                if will_retry {
                    let next = task.retry();
                    self.events.emit(RunEvent::TaskRetry {
                        task: next.clone(),
                        attempt: next.attempt,
                    });
                    self.lock_state().queue.push_back(next);
                } else {
                    let elapsed = started.elapsed().as_millis() as u64;
                    results.push(AuditResult::failure(&task, error, elapsed));
                }
            }
        }
    }

    fn next_task(&self) -> Option<Task> {
        self.lock_state().queue.pop_front()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        // The state is plain collections; a panic while holding the lock
        // cannot leave them logically inconsistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn flatten(
    result: Result<anyhow::Result<AuditResult>, Box<dyn std::any::Any + Send>>,
) -> Result<AuditResult, String> {
    match result {
        Ok(Ok(audit)) => Ok(audit),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("Task handler panicked: {}", message))
        }
    }
}
