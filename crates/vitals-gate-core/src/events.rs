//! Progress events
//!
//! Progress is reported through an explicitly owned channel rather than a
//! shared bus, so several runners in one process never see each other's
//! events. Whoever constructs the runner decides whether to listen.

use tokio::sync::mpsc;
use tracing::trace;

use crate::runner::RunSummary;
use crate::task::{AuditResult, Task};

/// A progress notification
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted { task_count: usize },
    ProfileStarted { profile: String, task_count: usize },
    TaskStarted(Task),
    TaskCompleted(AuditResult),
    TaskFailed { task: Task, error: String, will_retry: bool },
    TaskRetry { task: Task, attempt: u32 },
    /// A scheduler's queue is empty and nothing is in flight
    QueueDrained { results: usize },
    ProfileCompleted { profile: String },
    RunCompleted(Box<RunSummary>),
}

/// Sending half of a progress channel. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<RunEvent>>,
}

impl EventSink {
    /// A sink that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// A connected sink and its receiver
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Send without blocking; a closed receiver is ignored
    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("Progress receiver dropped; event discarded");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_delivers_in_order() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(RunEvent::RunStarted { task_count: 2 });
        sink.emit(RunEvent::QueueDrained { results: 2 });

        assert!(matches!(rx.recv().await, Some(RunEvent::RunStarted { task_count: 2 })));
        assert!(matches!(rx.recv().await, Some(RunEvent::QueueDrained { results: 2 })));
    }

    #[test]
    fn test_emit_after_receiver_dropped() {
        let (sink, rx) = EventSink::channel();
        drop(rx);
        sink.emit(RunEvent::RunStarted { task_count: 0 });
        EventSink::disabled().emit(RunEvent::RunStarted { task_count: 0 });
    }
}
