//! Single-file JSON storage for taskmill.
//!
//! The whole task list is one pretty-printed JSON array. Every write goes
//! to a temp file first and is renamed over the target, so readers observe
//! either the old state or the new one, never a torn write. A missing file
//! loads as an empty queue; a non-`.json` path is rejected at construction.
//!
//! Concurrency is an in-process lock only. Cross-process safety is NOT
//! provided; pointing several worker processes at one file is a
//! misconfiguration and is warned about by the manager.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::Storage;
use crate::error::{QueueError, QueueResult};
use crate::task::{dequeue_order, Task, TaskPatch, TaskStatus};

/// JSON-file storage adapter.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    /// Guards the whole load-mutate-persist cycle
    lock: Mutex<()>,
}

impl FileStorage {
    /// Create a file store at `path`. The path must end in `.json`; the
    /// file itself may not exist yet.
    pub fn new(path: impl Into<PathBuf>) -> QueueResult<Self> {
        let path = path.into();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            return Err(QueueError::config(format!(
                "file backend requires a .json path, got {}",
                path.display()
            )));
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    async fn load(&self) -> QueueResult<Vec<Task>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(QueueError::Serialization),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(QueueError::storage(
                format!("failed to read {}", self.path.display()),
                e,
            )),
        }
    }

    async fn persist(&self, tasks: &[Task]) -> QueueResult<()> {
        let body = serde_json::to_vec_pretty(tasks)?;
        let tmp = self.path.with_extension("json.tmp");

        tokio::fs::write(&tmp, &body).await.map_err(|e| {
            QueueError::storage(format!("failed to write {}", tmp.display()), e)
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            QueueError::storage(
                format!("failed to replace {}", self.path.display()),
                e,
            )
        })?;
        Ok(())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn enqueue(&self, task: Task) -> QueueResult<Task> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.load().await?;
        tasks.push(task.clone());
        self.persist(&tasks).await?;
        tracing::debug!(task_id = %task.id, handler = %task.handler, "enqueued task");
        Ok(task)
    }

    async fn dequeue(&self) -> QueueResult<Option<Task>> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.load().await?;

        let best = tasks
            .iter_mut()
            .filter(|t| t.status == TaskStatus::Pending)
            .min_by(|a, b| dequeue_order(a, b));

        let Some(task) = best else {
            return Ok(None);
        };
        task.status = TaskStatus::Processing;
        task.updated_at = Utc::now();
        let picked = task.clone();

        self.persist(&tasks).await?;
        tracing::debug!(task_id = %picked.id, "dequeued task");
        Ok(Some(picked))
    }

    async fn load_tasks(&self, status: Option<TaskStatus>) -> QueueResult<Vec<Task>> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.load().await?;
        if let Some(status) = status {
            tasks.retain(|t| t.status == status);
        }
        tasks.sort_by(|a, b| dequeue_order(a, b));
        Ok(tasks)
    }

    async fn get_task(&self, id: &str) -> QueueResult<Option<Task>> {
        let _guard = self.lock.lock().await;
        let tasks = self.load().await?;
        Ok(tasks.into_iter().find(|t| t.id == id))
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> QueueResult<Option<Task>> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.load().await?;

        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };
        patch.apply(task);
        let updated = task.clone();

        self.persist(&tasks).await?;
        Ok(Some(updated))
    }

    async fn delete_task(&self, id: &str, hard: bool) -> QueueResult<Option<Task>> {
        let _guard = self.lock.lock().await;
        let mut tasks = self.load().await?;

        if hard {
            let Some(index) = tasks.iter().position(|t| t.id == id) else {
                return Ok(None);
            };
            let removed = tasks.remove(index);
            self.persist(&tasks).await?;
            tracing::debug!(task_id = %id, "hard-deleted task");
            return Ok(Some(removed));
        }

        let Some(task) = tasks.iter_mut().find(|t| t.id == id) else {
            return Ok(None);
        };
        task.status = TaskStatus::Deleted;
        task.updated_at = Utc::now();
        let updated = task.clone();

        self.persist(&tasks).await?;
        Ok(Some(updated))
    }

    async fn health_check(&self) -> QueueResult<()> {
        let _guard = self.lock.lock().await;
        let tasks = self.load().await?;
        tracing::debug!(
            path = %self.path.display(),
            total = tasks.len(),
            "file storage health check"
        );
        Ok(())
    }
}
