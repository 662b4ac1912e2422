//! The queue manager: the primary interface for producers and operators.
//!
//! A [`QueueManager`] bundles the engine, its handler registry, and the
//! worker pool behind one surface: register handlers, add tasks, start and
//! stop workers, inspect and administer the queue.
//!
//! With `singleton = true` (the default), [`QueueManager::instance`]
//! returns one process-global manager; a later call carrying a different
//! backend configuration warns and returns the original. The singleton is a
//! convenience, not a correctness boundary — hold your own references via
//! [`QueueManager::new`] whenever that is clearer.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::Value;

use crate::config::{BackendConfig, QueueConfig};
use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, EventKind, TaskEvent};
use crate::registry::{HandlerOptions, HandlerRegistry};
use crate::storage::{Storage, StorageFactory, TaskStore};
use crate::task::{Task, TaskOptions, TaskPatch, TaskStatus};

pub mod engine;
pub mod worker;

pub use engine::QueueEngine;
pub use worker::WorkerPool;

/// Per-status task counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
    pub deleted: usize,
    pub total: usize,
}

/// The main queue manager.
pub struct QueueManager {
    engine: Arc<QueueEngine>,
    workers: WorkerPool,
}

static GLOBAL: OnceLock<Mutex<Option<Arc<QueueManager>>>> = OnceLock::new();

fn global() -> &'static Mutex<Option<Arc<QueueManager>>> {
    GLOBAL.get_or_init(|| Mutex::new(None))
}

impl QueueManager {
    /// Build a manager from configuration, constructing the storage adapter
    /// it selects. Validation failures are fatal here.
    pub async fn new(config: QueueConfig) -> QueueResult<Self> {
        config
            .validate()
            .map_err(|errors| QueueError::config(errors.join("; ")))?;
        crate::logging::init(&config.logging);

        let storage = StorageFactory::from_config(&config.backend).await?;
        Ok(Self::assemble(config, storage))
    }

    /// Build a manager over a user-provided storage adapter.
    pub async fn with_storage<S: Storage + 'static>(
        config: QueueConfig,
        storage: S,
    ) -> QueueResult<Self> {
        config
            .validate()
            .map_err(|errors| QueueError::config(errors.join("; ")))?;
        crate::logging::init(&config.logging);

        tracing::warn!(
            "custom storage adapter in use: atomic dequeue is the implementer's responsibility"
        );
        Ok(Self::assemble(config, Arc::new(storage)))
    }

    fn assemble(config: QueueConfig, storage: TaskStore) -> Self {
        let engine = Arc::new(QueueEngine::new(config, storage));
        let workers = WorkerPool::new(Arc::clone(&engine));
        Self { engine, workers }
    }

    /// Return the process-global manager, creating it on first call.
    ///
    /// With `singleton = false` every call yields a fresh manager with its
    /// own handler registry; the backend may still be shared.
    pub async fn instance(config: QueueConfig) -> QueueResult<Arc<Self>> {
        if !config.singleton {
            return Ok(Arc::new(Self::new(config).await?));
        }

        if let Some(existing) = global().lock().unwrap().clone() {
            if existing.engine.config().backend != config.backend {
                tracing::warn!(
                    "queue manager already initialized with a different backend, \
                     returning the original instance"
                );
            }
            return Ok(existing);
        }

        let manager = Arc::new(Self::new(config).await?);

        let mut guard = global().lock().unwrap();
        if let Some(existing) = guard.clone() {
            // lost the initialization race; keep the winner
            return Ok(existing);
        }
        *guard = Some(Arc::clone(&manager));
        Ok(manager)
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<QueueEngine> {
        &self.engine
    }

    /// The handler registry of this manager.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        self.engine.registry()
    }

    /// The event bus of this manager.
    pub fn events(&self) -> &Arc<EventBus> {
        self.engine.events()
    }

    /// The active configuration.
    pub fn config(&self) -> &QueueConfig {
        self.engine.config()
    }

    /// Register a handler under a name. A repeated name replaces the
    /// earlier registration.
    pub fn register<F, Fut>(&self, name: impl Into<String>, func: F, options: HandlerOptions)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = QueueResult<Value>> + Send + 'static,
    {
        self.engine.registry().register(name, func, options);
    }

    /// Subscribe to a lifecycle event.
    pub fn on<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.engine.events().on(kind, listener);
    }

    /// Enqueue a task for the named handler.
    pub async fn add_task(
        &self,
        handler: &str,
        payload: Value,
        options: TaskOptions,
    ) -> QueueResult<Task> {
        self.engine.add_task(handler, payload, options).await
    }

    /// Launch the worker pool with `concurrency` pollers.
    pub async fn start_workers(&self, concurrency: usize) -> QueueResult<()> {
        if concurrency > 1 && matches!(self.engine.config().backend, BackendConfig::File { .. }) {
            tracing::warn!(
                "file storage locks within this process only; \
                 pointing additional worker processes at the same file is unsafe"
            );
        }
        self.workers.start(concurrency).await
    }

    /// Stop the worker pool and wait for every poller to exit.
    pub async fn stop_workers(&self) -> QueueResult<()> {
        self.workers.stop().await
    }

    /// Whether the worker pool is running.
    pub fn is_running(&self) -> bool {
        self.workers.is_active()
    }

    /// Read a single task by id.
    pub async fn get_task_by_id(&self, id: &str) -> QueueResult<Option<Task>> {
        self.engine.get_task_by_id(id).await
    }

    /// Snapshot of tasks, optionally filtered by status.
    pub async fn get_all_tasks(&self, status: Option<TaskStatus>) -> QueueResult<Vec<Task>> {
        self.engine.get_all_tasks(status).await
    }

    /// Partially update a task's mutable fields (manual recovery included).
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> QueueResult<Option<Task>> {
        self.engine.update_task(id, patch).await
    }

    /// Soft delete by default; `hard = true` removes the row.
    pub async fn delete_task(&self, id: &str, hard: bool) -> QueueResult<Option<Task>> {
        self.engine.delete_task(id, hard).await
    }

    /// Per-status counts over a full snapshot.
    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let tasks = self.engine.get_all_tasks(None).await?;
        let mut stats = QueueStats {
            total: tasks.len(),
            ..Default::default()
        };
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Done => stats.done += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Deleted => stats.deleted += 1,
            }
        }
        Ok(stats)
    }

    /// Hard-delete every task. Emits no per-task events.
    pub async fn purge(&self) -> QueueResult<usize> {
        let tasks = self.engine.get_all_tasks(None).await?;
        let mut purged = 0;
        for task in tasks {
            if self
                .engine
                .storage()
                .delete_task(&task.id, true)
                .await?
                .is_some()
            {
                purged += 1;
            }
        }
        tracing::warn!(purged, "purged all tasks");
        Ok(purged)
    }

    /// Probe the storage backend.
    pub async fn health_check(&self) -> QueueResult<()> {
        self.engine.storage().health_check().await
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}
