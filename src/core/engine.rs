//! The queue engine: orchestrates enqueue, dequeue, updates, deletion, and
//! stuck-task reclamation, and owns event emission for those paths.
//!
//! Atomicity of dequeue is delegated to the storage adapter; the engine
//! adds no retries on top of a failed storage call. The engine is the only
//! component that mutates tasks outside of a worker recording an outcome.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, EventKind, TaskEvent};
use crate::registry::HandlerRegistry;
use crate::storage::TaskStore;
use crate::task::{
    resolve_policy, Task, TaskOptions, TaskPatch, TaskStatus, MAX_RETRIES_LIMIT,
};

/// The queue engine.
pub struct QueueEngine {
    config: QueueConfig,
    storage: TaskStore,
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
}

impl QueueEngine {
    pub fn new(config: QueueConfig, storage: TaskStore) -> Self {
        Self {
            config,
            storage,
            registry: Arc::new(HandlerRegistry::new()),
            events: Arc::new(EventBus::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn storage(&self) -> &TaskStore {
        &self.storage
    }

    /// Create and persist a pending task, emitting `taskAdded`.
    ///
    /// Policy resolves task overrides over handler defaults over engine
    /// defaults, once, here. Fails on a retry override above the hard cap,
    /// on an unknown handler when `strict` is set, and on a rejected
    /// payload unless `skip_on_payload_error` downgrades it to a warning.
    pub async fn add_task(
        &self,
        handler: &str,
        payload: Value,
        options: TaskOptions,
    ) -> QueueResult<Task> {
        if let Some(requested) = options.max_retries {
            if requested > MAX_RETRIES_LIMIT {
                return Err(QueueError::MaxRetriesLimit {
                    requested,
                    limit: MAX_RETRIES_LIMIT,
                });
            }
        }

        let entry = self.registry.get(handler);
        if entry.is_none() {
            if options.strict {
                return Err(QueueError::HandlerNotRegistered {
                    handler: handler.to_string(),
                });
            }
            tracing::warn!(
                handler,
                "handler not registered in this process, enqueuing anyway"
            );
        }

        let outcome = self.registry.validate(handler, &payload);
        if !outcome.valid {
            let message = outcome
                .message
                .unwrap_or_else(|| "payload rejected".to_string());
            if options.skip_on_payload_error {
                tracing::warn!(handler, %message, "payload validation failed, enqueuing anyway");
            } else {
                return Err(QueueError::InvalidPayload {
                    handler: handler.to_string(),
                    message,
                });
            }
        }

        let policy = resolve_policy(&options, entry.as_ref().map(|e| &e.options), &self.config);
        let task = Task::new(
            handler,
            payload,
            options.priority.unwrap_or(0),
            policy,
        );

        let task = self.storage.enqueue(task).await?;
        tracing::debug!(task_id = %task.id, handler, priority = task.priority, "task added");
        self.events.emit_task(EventKind::Added, &task);
        Ok(task)
    }

    /// Return the next runnable task, atomically flipped to `processing`.
    ///
    /// When nothing is runnable, the stuck detector runs opportunistically
    /// before returning `None`; a reclaimed task is picked up by a later
    /// poll.
    pub async fn dequeue(&self) -> QueueResult<Option<Task>> {
        match self.storage.dequeue().await? {
            Some(task) => Ok(Some(task)),
            None => {
                self.reclaim_stuck().await?;
                Ok(None)
            }
        }
    }

    /// Apply a partial update to a task's mutable fields.
    ///
    /// A status change is checked against the lifecycle first and rejected
    /// when illegal. Same-status patches pass through (refreshing
    /// `updated_at`).
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> QueueResult<Option<Task>> {
        if let Some(next) = patch.status {
            let Some(current) = self.storage.get_task(id).await? else {
                return Ok(None);
            };
            if current.status != next && !current.status.can_transition_to(next) {
                return Err(QueueError::InvalidTransition {
                    from: current.status,
                    to: next,
                });
            }
        }
        self.storage.update_task(id, patch).await
    }

    /// Read a single task; may reflect a soft-deleted row.
    pub async fn get_task_by_id(&self, id: &str) -> QueueResult<Option<Task>> {
        self.storage.get_task(id).await
    }

    /// Snapshot of all tasks, optionally filtered by status.
    pub async fn get_all_tasks(&self, status: Option<TaskStatus>) -> QueueResult<Vec<Task>> {
        self.storage.load_tasks(status).await
    }

    /// Soft delete by default (status flip, row retained); hard delete
    /// removes the row. Emits `taskRemoved` once per task — repeating a
    /// soft delete returns the same terminal row silently.
    pub async fn delete_task(&self, id: &str, hard: bool) -> QueueResult<Option<Task>> {
        let Some(current) = self.storage.get_task(id).await? else {
            return Ok(None);
        };

        if !hard {
            if current.status == TaskStatus::Deleted {
                return Ok(Some(current));
            }
            if !current.status.can_transition_to(TaskStatus::Deleted) {
                return Err(QueueError::InvalidTransition {
                    from: current.status,
                    to: TaskStatus::Deleted,
                });
            }
        }

        let removed = self.storage.delete_task(id, hard).await?;
        if let Some(task) = &removed {
            tracing::debug!(task_id = %id, hard, "task removed");
            self.events.emit_task(EventKind::Removed, task);
        }
        Ok(removed)
    }

    /// Scan `processing` tasks and reclaim the ones whose owners have gone
    /// quiet for longer than their processing budget.
    ///
    /// This is the single authoritative path for timeout accounting: a task
    /// with retry budget left goes back to `pending` with `retry_count`
    /// bumped (`taskStuck` then `taskRetried`); an exhausted one fails with
    /// an "exceeded N/M retries" log (`taskStuck` then `taskFailed`).
    pub async fn reclaim_stuck(&self) -> QueueResult<usize> {
        let now = Utc::now();
        let processing = self.storage.load_tasks(Some(TaskStatus::Processing)).await?;
        let mut reclaimed = 0;

        for task in processing {
            if !task.is_stuck(now) {
                continue;
            }

            self.events.emit_task(EventKind::Stuck, &task);

            if task.retry_count < task.max_retries {
                let patch = TaskPatch::new()
                    .status(TaskStatus::Pending)
                    .retry_count(task.retry_count + 1)
                    .updated_at(now);
                if let Some(updated) = self.storage.update_task(&task.id, patch).await? {
                    tracing::warn!(
                        task_id = %task.id,
                        retry = updated.retry_count,
                        max_retries = updated.max_retries,
                        "reclaimed stuck task"
                    );
                    self.events.emit_task(EventKind::Retried, &updated);
                    reclaimed += 1;
                }
            } else {
                let log = format!(
                    "exceeded {}/{} retries",
                    task.retry_count, task.max_retries
                );
                let patch = TaskPatch::new()
                    .status(TaskStatus::Failed)
                    .log(log.clone())
                    .updated_at(now);
                if let Some(updated) = self.storage.update_task(&task.id, patch).await? {
                    tracing::error!(task_id = %task.id, %log, "stuck task failed permanently");
                    self.events.emit(&TaskEvent::failed(updated, log));
                    reclaimed += 1;
                }
            }
        }

        Ok(reclaimed)
    }
}

impl std::fmt::Debug for QueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandlerOptions, Validation};
    use crate::storage::StorageFactory;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_engine() -> QueueEngine {
        QueueEngine::new(QueueConfig::testing(), StorageFactory::memory())
    }

    fn register_noop(engine: &QueueEngine, name: &str) {
        engine
            .registry()
            .register(name, |payload| async move { Ok(payload) }, HandlerOptions::new());
    }

    #[tokio::test]
    async fn test_add_task_assigns_policy_and_emits_added() {
        let engine = test_engine();
        register_noop(&engine, "noop");

        let added = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&added);
        engine.events().on(EventKind::Added, move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        let task = engine
            .add_task("noop", json!({"x": 1}), TaskOptions::new().priority(4))
            .await
            .unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.priority, 4);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.max_retries, engine.config().max_retries);
        assert_eq!(added.load(Ordering::SeqCst), 1);

        // enqueue → load-by-id round-trips the non-timestamp fields
        let loaded = engine.get_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(loaded.handler, "noop");
        assert_eq!(loaded.payload, json!({"x": 1}));
        assert_eq!(loaded.priority, 4);
        assert_eq!(loaded.max_retries, task.max_retries);
        assert_eq!(loaded.max_processing_time_ms, task.max_processing_time_ms);
    }

    #[tokio::test]
    async fn test_add_task_rejects_retries_over_cap() {
        let engine = test_engine();
        register_noop(&engine, "noop");

        let err = engine
            .add_task(
                "noop",
                json!(null),
                TaskOptions::new().max_retries(MAX_RETRIES_LIMIT + 1),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::MaxRetriesLimit { .. }));
    }

    #[tokio::test]
    async fn test_add_task_strict_requires_registration() {
        let engine = test_engine();

        let err = engine
            .add_task("ghost", json!(null), TaskOptions::new().strict())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::HandlerNotRegistered { .. }));

        // without strict the task is enqueued with a warning
        let task = engine
            .add_task("ghost", json!(null), TaskOptions::new())
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_add_task_payload_validation() {
        let engine = test_engine();
        engine.registry().register(
            "send_email",
            |payload| async move { Ok(payload) },
            HandlerOptions::new().validator(|p| {
                if p.get("to").is_some() {
                    Validation::ok()
                } else {
                    Validation::fail("field 'to' is required")
                }
            }),
        );

        let err = engine
            .add_task("send_email", json!({}), TaskOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload { .. }));
        assert!(err.to_string().contains("'to' is required"));

        // warn-and-continue
        let task = engine
            .add_task(
                "send_email",
                json!({}),
                TaskOptions::new().skip_on_payload_error(),
            )
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_handler_policy_defaults_apply() {
        let engine = test_engine();
        engine.registry().register(
            "slow",
            |payload| async move { Ok(payload) },
            HandlerOptions::new().max_retries(9).max_processing_time_ms(42),
        );

        let task = engine
            .add_task("slow", json!(null), TaskOptions::new())
            .await
            .unwrap();
        assert_eq!(task.max_retries, 9);
        assert_eq!(task.max_processing_time_ms, 42);

        // task override wins over the handler default
        let task = engine
            .add_task("slow", json!(null), TaskOptions::new().max_retries(2))
            .await
            .unwrap();
        assert_eq!(task.max_retries, 2);
        assert_eq!(task.max_processing_time_ms, 42);
    }

    #[tokio::test]
    async fn test_dequeue_flips_status_and_empty_is_none() {
        let engine = test_engine();
        register_noop(&engine, "noop");

        assert!(engine.dequeue().await.unwrap().is_none());

        engine
            .add_task("noop", json!(null), TaskOptions::new())
            .await
            .unwrap();

        let task = engine.dequeue().await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Processing);
        assert!(engine.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_task_rejects_illegal_transition() {
        let engine = test_engine();
        register_noop(&engine, "noop");

        let task = engine
            .add_task("noop", json!(null), TaskOptions::new())
            .await
            .unwrap();

        // pending → done skips processing
        let err = engine
            .update_task(&task.id, TaskPatch::new().status(TaskStatus::Done))
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        // the legal path works
        engine.dequeue().await.unwrap();
        let updated = engine
            .update_task(&task.id, TaskPatch::new().status(TaskStatus::Done))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, TaskStatus::Done);

        // unknown id is a clean miss
        assert!(engine
            .update_task("nope", TaskPatch::new().status(TaskStatus::Done))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_soft_delete_is_idempotent_and_emits_once() {
        let engine = test_engine();
        register_noop(&engine, "noop");

        let removed = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&removed);
        engine.events().on(EventKind::Removed, move |_| {
            r.fetch_add(1, Ordering::SeqCst);
        });

        let task = engine
            .add_task("noop", json!(null), TaskOptions::new())
            .await
            .unwrap();

        let first = engine.delete_task(&task.id, false).await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Deleted);
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        let second = engine.delete_task(&task.id, false).await.unwrap().unwrap();
        assert_eq!(second.status, TaskStatus::Deleted);
        assert_eq!(second.id, first.id);
        assert_eq!(removed.load(Ordering::SeqCst), 1);

        // soft-deleted rows still show up in unfiltered reads
        let all = engine.get_all_tasks(None).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_processing_task_rejected() {
        let engine = test_engine();
        register_noop(&engine, "noop");

        let task = engine
            .add_task("noop", json!(null), TaskOptions::new())
            .await
            .unwrap();
        engine.dequeue().await.unwrap();

        let err = engine.delete_task(&task.id, false).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidTransition { .. }));

        // hard delete is always allowed
        let removed = engine.delete_task(&task.id, true).await.unwrap().unwrap();
        assert_eq!(removed.id, task.id);
        assert!(engine.get_task_by_id(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reclaim_stuck_retries_then_fails() {
        let engine = test_engine();
        engine.registry().register(
            "sleepy",
            |payload| async move { Ok(payload) },
            HandlerOptions::new(),
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in [EventKind::Stuck, EventKind::Retried, EventKind::Failed] {
            let log = Arc::clone(&events);
            engine.events().on(kind, move |event| {
                log.lock().unwrap().push(event.kind);
            });
        }

        let task = engine
            .add_task(
                "sleepy",
                json!(null),
                TaskOptions::new().max_retries(1).max_processing_time_ms(30),
            )
            .await
            .unwrap();

        // first attempt: claim it and let it go stale
        engine.dequeue().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        let reclaimed = engine.reclaim_stuck().await.unwrap();
        assert_eq!(reclaimed, 1);

        let after = engine.get_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Pending);
        assert_eq!(after.retry_count, 1);

        // second attempt: budget exhausted, fails with the retries log
        engine.dequeue().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        let reclaimed = engine.reclaim_stuck().await.unwrap();
        assert_eq!(reclaimed, 1);

        let after = engine.get_task_by_id(&task.id).await.unwrap().unwrap();
        assert_eq!(after.status, TaskStatus::Failed);
        assert_eq!(after.retry_count, 1);
        assert_eq!(after.log.as_deref(), Some("exceeded 1/1 retries"));

        let seen = events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                EventKind::Stuck,
                EventKind::Retried,
                EventKind::Stuck,
                EventKind::Failed
            ]
        );
    }

    #[tokio::test]
    async fn test_reclaim_ignores_fresh_processing_tasks() {
        let engine = test_engine();
        register_noop(&engine, "noop");

        engine
            .add_task(
                "noop",
                json!(null),
                TaskOptions::new().max_processing_time_ms(60_000),
            )
            .await
            .unwrap();
        engine.dequeue().await.unwrap();

        assert_eq!(engine.reclaim_stuck().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_untouched_tasks_stay_pending() {
        let engine = test_engine();
        register_noop(&engine, "noop");

        for _ in 0..3 {
            engine
                .add_task("noop", json!(null), TaskOptions::new())
                .await
                .unwrap();
        }

        let all = engine.get_all_tasks(None).await.unwrap();
        assert_eq!(all.len(), 3);
        for task in all {
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.retry_count, 0);
        }
    }
}
