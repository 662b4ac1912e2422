//! Storage adapters for task persistence.
//!
//! The engine talks to persistence exclusively through the [`Storage`]
//! contract. Concrete adapters differ in durability and in how they realize
//! atomic dequeue:
//!
//! - **Memory**: process-local map behind a dequeue lock; no durability
//! - **File**: one pretty-printed JSON array, atomically replaced via
//!   write-temp-then-rename; single-process only
//! - **Redis**: per-task keys plus per-status sorted sets; dequeue is one
//!   server-side Lua script, safe across processes
//! - **Postgres**: one row per task; dequeue uses
//!   `FOR UPDATE SKIP LOCKED`, safe across processes
//!
//! A custom adapter is any further [`Storage`] impl handed to
//! `QueueManager::with_storage`; atomic dequeue is then the implementer's
//! responsibility.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::BackendConfig;
use crate::error::QueueResult;
use crate::task::{Task, TaskPatch, TaskStatus};

pub mod file;
pub mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

#[cfg(feature = "redis-storage")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
pub mod redis;

#[cfg(feature = "redis-storage")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
pub use redis::RedisStorage;

#[cfg(feature = "postgres-storage")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres-storage")))]
pub mod postgres;

#[cfg(feature = "postgres-storage")]
#[cfg_attr(docsrs, doc(cfg(feature = "postgres-storage")))]
pub use postgres::PostgresStorage;

/// Contract every storage adapter implements.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Durably add a task. Ordering comes only from what `priority` and
    /// `created_at` encode; the adapter adds no ordering of its own.
    async fn enqueue(&self, task: Task) -> QueueResult<Task>;

    /// Atomically select the best pending task — maximizing
    /// `(priority, -created_at)` with `id` as the final tiebreaker — flip it
    /// to `processing` with `updated_at = now`, and return it.
    ///
    /// Under concurrent invocations across workers and processes, each
    /// pending task is returned to exactly one caller. Returns `None`
    /// without blocking when nothing is runnable.
    async fn dequeue(&self) -> QueueResult<Option<Task>>;

    /// Snapshot read of all tasks, optionally filtered by status. Includes
    /// soft-deleted rows when unfiltered.
    async fn load_tasks(&self, status: Option<TaskStatus>) -> QueueResult<Vec<Task>>;

    /// Fetch a single task by id.
    async fn get_task(&self, id: &str) -> QueueResult<Option<Task>>;

    /// Apply a partial update to the mutable fields. Last-writer-wins;
    /// compare-and-set is not part of the contract. Returns the updated
    /// task, or `None` if the id is unknown.
    async fn update_task(&self, id: &str, patch: TaskPatch) -> QueueResult<Option<Task>>;

    /// Soft delete (status flip to `deleted`) or hard delete (row removal).
    /// Returns the affected task, or `None` if the id is unknown.
    async fn delete_task(&self, id: &str, hard: bool) -> QueueResult<Option<Task>>;

    /// Cheap liveness probe of the backing store.
    async fn health_check(&self) -> QueueResult<()>;
}

/// Convenient alias for a shared storage handle.
pub type TaskStore = Arc<dyn Storage>;

/// Factory methods for creating storage adapters.
pub struct StorageFactory;

impl StorageFactory {
    /// Create an in-memory store.
    pub fn memory() -> TaskStore {
        Arc::new(MemoryStorage::new())
    }

    /// Create a JSON-file store.
    pub fn file(path: impl Into<std::path::PathBuf>) -> QueueResult<TaskStore> {
        Ok(Arc::new(FileStorage::new(path)?))
    }

    /// Create a Redis store.
    #[cfg(feature = "redis-storage")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-storage")))]
    pub async fn redis(config: &crate::config::RedisConfig) -> QueueResult<TaskStore> {
        Ok(Arc::new(RedisStorage::new(config).await?))
    }

    /// Create a PostgreSQL store.
    #[cfg(feature = "postgres-storage")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres-storage")))]
    pub async fn postgres(config: &crate::config::PostgresConfig) -> QueueResult<TaskStore> {
        Ok(Arc::new(PostgresStorage::new(config).await?))
    }

    /// Build the store selected by a [`BackendConfig`].
    pub async fn from_config(backend: &BackendConfig) -> QueueResult<TaskStore> {
        match backend {
            BackendConfig::Memory => Ok(Self::memory()),
            BackendConfig::File { path } => Self::file(path.clone()),
            #[cfg(feature = "redis-storage")]
            BackendConfig::Redis(config) => Self::redis(config).await,
            #[cfg(feature = "postgres-storage")]
            BackendConfig::Postgres(config) => Self::postgres(config).await,
        }
    }
}
