//! # taskmill
//!
//! A durable, handler-dispatched background task queue for Rust
//! applications.
//!
//! ## Features
//!
//! - **Handler dispatch**: enqueue `(handler name, payload)` pairs; workers
//!   route each task to the registered handler
//! - **Persistent lifecycle**: pending → processing → done/failed, with
//!   soft deletion retained for audit
//! - **Retries and timeouts**: per-task retry caps and processing budgets,
//!   resolved task → handler → engine
//! - **Priority ordering**: higher priority first, FIFO within a priority
//! - **Stuck-task reclamation**: tasks abandoned mid-processing are retried
//!   or failed automatically
//! - **Pluggable storage**: in-memory, single-file JSON, Redis, PostgreSQL,
//!   or any custom [`Storage`] implementation
//! - **Lifecycle events**: synchronous subscriptions to added / started /
//!   completed / failed / retried / removed / stuck
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use taskmill::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> QueueResult<()> {
//!     let manager = QueueManager::instance(QueueConfig::memory()).await?;
//!
//!     manager.register(
//!         "send_email",
//!         |payload| async move {
//!             // your delivery logic
//!             Ok(payload)
//!         },
//!         HandlerOptions::new().max_retries(5),
//!     );
//!
//!     manager
//!         .add_task("send_email", json!({"to": "user@example.com"}), TaskOptions::new())
//!         .await?;
//!
//!     manager.start_workers(4).await?;
//!     // ...
//!     manager.stop_workers().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Delivery semantics
//!
//! Execution is at-least-once: if a worker dies mid-attempt, the stuck
//! detector eventually hands the task to another worker. Handlers must be
//! idempotent to tolerate duplicate execution.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod core;
pub mod error;
pub mod events;
pub mod logging;
pub mod registry;
pub mod storage;
pub mod task;

pub mod prelude {
    pub use crate::config::{BackendConfig, LogLevel, LoggingConfig, QueueConfig};
    pub use crate::core::{QueueEngine, QueueManager, QueueStats, WorkerPool};
    pub use crate::error::{QueueError, QueueResult};
    pub use crate::events::{EventKind, TaskEvent};
    pub use crate::registry::{HandlerOptions, HandlerRegistry, Validation};
    pub use crate::storage::{Storage, StorageFactory, TaskStore};
    pub use crate::task::{Task, TaskId, TaskOptions, TaskPatch, TaskStatus};
}

pub use crate::config::{BackendConfig, QueueConfig};
pub use crate::core::{QueueEngine, QueueManager, QueueStats, WorkerPool};
pub use crate::error::{QueueError, QueueResult};
pub use crate::events::{EventKind, TaskEvent};
pub use crate::registry::{HandlerOptions, HandlerRegistry, Validation};
pub use crate::storage::{Storage, StorageFactory, TaskStore};
pub use crate::task::{Task, TaskId, TaskOptions, TaskPatch, TaskStatus, MAX_RETRIES_LIMIT};
