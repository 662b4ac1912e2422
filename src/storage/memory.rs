//! In-memory storage for taskmill.
//!
//! Tasks live in a process-local map. A dedicated dequeue lock serializes
//! concurrent pollers within the process so each pending task is handed to
//! exactly one of them. Nothing survives a restart; suitable for
//! development, tests, and single-process deployments only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, RwLock};

use super::Storage;
use crate::error::QueueResult;
use crate::task::{dequeue_order, Task, TaskId, TaskPatch, TaskStatus};

/// In-memory storage adapter.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Task storage indexed by task id
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
    /// Serializes concurrent dequeues within this process
    dequeue_lock: Arc<Mutex<()>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn enqueue(&self, task: Task) -> QueueResult<Task> {
        let mut tasks = self.tasks.write().await;
        tasks.insert(task.id.clone(), task.clone());
        tracing::debug!(task_id = %task.id, handler = %task.handler, "enqueued task");
        Ok(task)
    }

    async fn dequeue(&self) -> QueueResult<Option<Task>> {
        let _guard = self.dequeue_lock.lock().await;
        let mut tasks = self.tasks.write().await;

        let best_id = tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .min_by(|a, b| dequeue_order(a, b))
            .map(|t| t.id.clone());

        let Some(id) = best_id else {
            return Ok(None);
        };

        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };
        task.status = TaskStatus::Processing;
        task.updated_at = Utc::now();

        tracing::debug!(task_id = %id, "dequeued task");
        Ok(Some(task.clone()))
    }

    async fn load_tasks(&self, status: Option<TaskStatus>) -> QueueResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut result: Vec<Task> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        result.sort_by(|a, b| dequeue_order(a, b));
        Ok(result)
    }

    async fn get_task(&self, id: &str) -> QueueResult<Option<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(id).cloned())
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> QueueResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(id) else {
            return Ok(None);
        };
        patch.apply(task);
        Ok(Some(task.clone()))
    }

    async fn delete_task(&self, id: &str, hard: bool) -> QueueResult<Option<Task>> {
        let mut tasks = self.tasks.write().await;

        if hard {
            let removed = tasks.remove(id);
            if removed.is_some() {
                tracing::debug!(task_id = %id, "hard-deleted task");
            }
            return Ok(removed);
        }

        let Some(task) = tasks.get_mut(id) else {
            return Ok(None);
        };
        task.status = TaskStatus::Deleted;
        task.updated_at = Utc::now();
        Ok(Some(task.clone()))
    }

    async fn health_check(&self) -> QueueResult<()> {
        let tasks = self.tasks.read().await;
        tracing::debug!(total = tasks.len(), "memory storage health check");
        Ok(())
    }
}
