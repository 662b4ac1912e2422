//! Lifecycle event fan-out.
//!
//! The bus is synchronous: emitting calls every subscriber for the event
//! kind, in registration order, before returning. Listener lists are
//! copy-on-write snapshots, so a listener re-subscribing during emission
//! never deadlocks or sees itself mid-fan-out. Nothing is persisted; a
//! subscriber that registers after an event was emitted cannot recover it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use crate::task::Task;

/// The lifecycle events a queue emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A task was enqueued
    Added,
    /// A worker began executing a task
    Started,
    /// A task finished successfully
    Completed,
    /// An attempt failed (handler error or exhausted retries)
    Failed,
    /// A task was reset to pending for another attempt
    Retried,
    /// A task was deleted
    Removed,
    /// The stuck detector reclaimed an abandoned task
    Stuck,
}

impl EventKind {
    /// Public event name, as seen by subscribers.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "taskAdded",
            EventKind::Started => "taskStarted",
            EventKind::Completed => "taskCompleted",
            EventKind::Failed => "taskFailed",
            EventKind::Retried => "taskRetried",
            EventKind::Removed => "taskRemoved",
            EventKind::Stuck => "taskStuck",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted event: the kind, a task snapshot, and the error text for
/// failure events.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub kind: EventKind,
    pub task: Task,
    pub error: Option<String>,
}

impl TaskEvent {
    pub fn new(kind: EventKind, task: Task) -> Self {
        Self {
            kind,
            task,
            error: None,
        }
    }

    pub fn failed(task: Task, error: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Failed,
            task,
            error: Some(error.into()),
        }
    }
}

/// Subscriber callback.
pub type EventListener = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// Synchronous per-kind event fan-out.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Arc<Vec<EventListener>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to one event kind. Listeners fire in registration order.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        let Ok(mut map) = self.listeners.write() else {
            tracing::error!("event bus lock poisoned, dropping subscription");
            return;
        };
        let entry = map.entry(kind).or_default();
        let mut next: Vec<EventListener> = entry.as_ref().clone();
        next.push(Arc::new(listener));
        *entry = Arc::new(next);
    }

    /// Emit an event to every subscriber of its kind.
    ///
    /// A panicking listener is logged and skipped; it never aborts the
    /// fan-out or the caller.
    pub fn emit(&self, event: &TaskEvent) {
        let snapshot = match self.listeners.read() {
            Ok(map) => map.get(&event.kind).cloned(),
            Err(_) => {
                tracing::error!("event bus lock poisoned, dropping event");
                None
            }
        };

        let Some(listeners) = snapshot else {
            return;
        };

        for listener in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!(
                    event = %event.kind,
                    task_id = %event.task.id,
                    "event listener panicked"
                );
            }
        }
    }

    /// Convenience for the common snapshot-only events.
    pub fn emit_task(&self, kind: EventKind, task: &Task) {
        self.emit(&TaskEvent::new(kind, task.clone()));
    }

    /// Number of listeners registered for a kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .ok()
            .and_then(|map| map.get(&kind).map(|l| l.len()))
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ResolvedPolicy, Task};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn make_task() -> Task {
        Task::new(
            "noop",
            json!({}),
            0,
            ResolvedPolicy {
                max_retries: 3,
                max_processing_time_ms: 1_000,
            },
        )
    }

    #[test]
    fn test_emit_reaches_subscribers_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.on(EventKind::Added, move |_| {
                seen.lock().unwrap().push(tag);
            });
        }

        bus.emit_task(EventKind::Added, &make_task());
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_emit_only_matching_kind() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&count);
        bus.on(EventKind::Completed, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit_task(EventKind::Added, &make_task());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        bus.emit_task(EventKind::Completed, &make_task());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_listener_does_not_abort_fanout() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.on(EventKind::Failed, |_| panic!("bad subscriber"));
        let c = Arc::clone(&count);
        bus.on(EventKind::Failed, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(&TaskEvent::failed(make_task(), "boom"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_resubscribe_during_emission() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_bus = Arc::clone(&bus);
        let inner_count = Arc::clone(&count);
        bus.on(EventKind::Added, move |_| {
            let c = Arc::clone(&inner_count);
            inner_bus.on(EventKind::Added, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        });

        // first emit registers a second listener but does not invoke it
        bus.emit_task(EventKind::Added, &make_task());
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(EventKind::Added), 2);

        // second emit reaches the listener added during the first
        bus.emit_task(EventKind::Added, &make_task());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_event_carries_error() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(None));

        let s = Arc::clone(&seen);
        bus.on(EventKind::Failed, move |event| {
            *s.lock().unwrap() = event.error.clone();
        });

        bus.emit(&TaskEvent::failed(make_task(), "connection refused"));
        assert_eq!(seen.lock().unwrap().as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(EventKind::Added.as_str(), "taskAdded");
        assert_eq!(EventKind::Completed.as_str(), "taskCompleted");
        assert_eq!(EventKind::Stuck.as_str(), "taskStuck");
    }
}
