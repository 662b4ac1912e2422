//! Redis storage for taskmill.
//!
//! Layout: one string key per task holding its JSON body, plus one sorted
//! set per status:
//!
//! - `{prefix}:task:{id}` — task JSON
//! - `{prefix}:queue:{status}` — member = task id, score =
//!   `priority * 10^6 - created_at_millis`, so descending score yields the
//!   dequeue order (priority desc, created_at asc)
//!
//! Enqueue is a SET + ZADD inside an atomic pipeline. Dequeue, update, and
//! delete each run as a single server-side Lua script, which is what makes
//! them safe under concurrent workers across processes — the script pops
//! the top of the pending set, rewrites the task body, and moves it between
//! status sets in one invocation.

use async_trait::async_trait;
use chrono::Utc;
use redis::{aio::ConnectionManager, AsyncCommands, Client, Script};
use std::time::Duration;
use tokio::time::timeout;

use super::Storage;
use crate::config::RedisConfig;
use crate::error::{QueueError, QueueResult};
use crate::task::{Task, TaskPatch, TaskStatus};

/// Pre-compiled Lua scripts for the atomic operations.
struct RedisScripts {
    dequeue: Script,
    update: Script,
    delete: Script,
}

impl RedisScripts {
    fn new() -> Self {
        Self {
            dequeue: Script::new(
                r#"
                local pending_key = KEYS[1]
                local processing_key = KEYS[2]
                local prefix = ARGV[1]
                local now = tonumber(ARGV[2])

                local top = redis.call('ZRANGE', pending_key, 0, 0, 'REV', 'WITHSCORES')
                if #top == 0 then
                    return nil
                end
                local score = top[2]

                -- equal scores sort lexicographically by member, so the
                -- first member at the top score is the smallest id
                local ids = redis.call('ZRANGEBYSCORE', pending_key, score, score, 'LIMIT', 0, 1)
                local task_id = ids[1]
                redis.call('ZREM', pending_key, task_id)

                local task_key = prefix .. ':task:' .. task_id
                local task_data = redis.call('GET', task_key)
                if not task_data then
                    return nil
                end

                local task = cjson.decode(task_data)
                task.status = 'processing'
                task.updated_at = now
                local updated = cjson.encode(task)
                redis.call('SET', task_key, updated)
                redis.call('ZADD', processing_key, score, task_id)

                return updated
            "#,
            ),
            update: Script::new(
                r#"
                local prefix = KEYS[1]
                local task_id = ARGV[1]
                local new_status = ARGV[2]
                local has_log = ARGV[3]
                local log = ARGV[4]
                local retry_count = tonumber(ARGV[5])
                local now = tonumber(ARGV[6])

                local task_key = prefix .. ':task:' .. task_id
                local task_data = redis.call('GET', task_key)
                if not task_data then
                    return nil
                end

                local task = cjson.decode(task_data)
                local old_status = task.status

                if new_status ~= '' then
                    task.status = new_status
                end
                if has_log == '1' then
                    task.log = log
                end
                if retry_count >= 0 then
                    task.retry_count = retry_count
                end
                task.updated_at = now

                if new_status ~= '' and new_status ~= old_status then
                    local score = task.priority * 1000000 - task.created_at
                    redis.call('ZREM', prefix .. ':queue:' .. old_status, task_id)
                    redis.call('ZADD', prefix .. ':queue:' .. new_status, score, task_id)
                end

                local updated = cjson.encode(task)
                redis.call('SET', task_key, updated)
                return updated
            "#,
            ),
            delete: Script::new(
                r#"
                local prefix = KEYS[1]
                local task_id = ARGV[1]
                local hard = ARGV[2]
                local now = tonumber(ARGV[3])

                local task_key = prefix .. ':task:' .. task_id
                local task_data = redis.call('GET', task_key)
                if not task_data then
                    return nil
                end

                local task = cjson.decode(task_data)
                local old_status = task.status

                if hard == '1' then
                    redis.call('ZREM', prefix .. ':queue:' .. old_status, task_id)
                    redis.call('DEL', task_key)
                    return task_data
                end

                task.status = 'deleted'
                task.updated_at = now
                local score = task.priority * 1000000 - task.created_at

                redis.call('ZREM', prefix .. ':queue:' .. old_status, task_id)
                redis.call('ZADD', prefix .. ':queue:deleted', score, task_id)

                local updated = cjson.encode(task)
                redis.call('SET', task_key, updated)
                return updated
            "#,
            ),
        }
    }
}

/// Redis storage adapter.
pub struct RedisStorage {
    conn: ConnectionManager,
    config: RedisConfig,
    scripts: RedisScripts,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStorage {
    /// Connect to Redis and build the adapter.
    pub async fn new(config: &RedisConfig) -> QueueResult<Self> {
        let client = Client::open(config.url.as_str())?;

        let conn = timeout(Duration::from_secs(10), client.get_connection_manager())
            .await
            .map_err(|e| QueueError::storage("timed out connecting to redis", e))??;

        tracing::info!(prefix = %config.key_prefix, "connected to redis");

        Ok(Self {
            conn,
            config: config.clone(),
            scripts: RedisScripts::new(),
        })
    }

    fn task_key(&self, id: &str) -> String {
        format!("{}:task:{}", self.config.key_prefix, id)
    }

    fn queue_key(&self, status: TaskStatus) -> String {
        format!("{}:queue:{}", self.config.key_prefix, status.as_str())
    }

    /// Sorted-set score: higher priority first, then older `created_at`.
    fn score(task: &Task) -> f64 {
        task.priority as f64 * 1_000_000.0 - task.created_at.timestamp_millis() as f64
    }

    fn deserialize(data: &str) -> QueueResult<Task> {
        serde_json::from_str(data).map_err(QueueError::Serialization)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn enqueue(&self, task: Task) -> QueueResult<Task> {
        let mut conn = self.conn.clone();
        let body = serde_json::to_string(&task)?;

        redis::pipe()
            .atomic()
            .set(self.task_key(&task.id), &body)
            .zadd(self.queue_key(task.status), &task.id, Self::score(&task))
            .query_async::<()>(&mut conn)
            .await?;

        tracing::debug!(task_id = %task.id, handler = %task.handler, "enqueued task");
        Ok(task)
    }

    async fn dequeue(&self) -> QueueResult<Option<Task>> {
        let mut conn = self.conn.clone();

        let result: Option<String> = self
            .scripts
            .dequeue
            .key(self.queue_key(TaskStatus::Pending))
            .key(self.queue_key(TaskStatus::Processing))
            .arg(&self.config.key_prefix)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        match result {
            Some(body) => {
                let task = Self::deserialize(&body)?;
                tracing::debug!(task_id = %task.id, "dequeued task");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn load_tasks(&self, status: Option<TaskStatus>) -> QueueResult<Vec<Task>> {
        let mut conn = self.conn.clone();
        let statuses: Vec<TaskStatus> = match status {
            Some(s) => vec![s],
            None => TaskStatus::ALL.to_vec(),
        };

        let mut tasks = Vec::new();
        for status in statuses {
            // descending score == dequeue order within the status
            let ids: Vec<String> = conn
                .zrevrange(self.queue_key(status), 0, -1)
                .await?;

            for id in ids {
                let body: Option<String> = conn.get(self.task_key(&id)).await?;
                if let Some(body) = body {
                    tasks.push(Self::deserialize(&body)?);
                }
            }
        }

        Ok(tasks)
    }

    async fn get_task(&self, id: &str) -> QueueResult<Option<Task>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = conn.get(self.task_key(id)).await?;
        body.as_deref().map(Self::deserialize).transpose()
    }

    async fn update_task(&self, id: &str, patch: TaskPatch) -> QueueResult<Option<Task>> {
        let mut conn = self.conn.clone();

        let new_status = patch.status.map(|s| s.as_str()).unwrap_or("");
        let (has_log, log) = match &patch.log {
            Some(log) => ("1", log.as_str()),
            None => ("0", ""),
        };
        let retry_count = patch.retry_count.map(|c| c as i64).unwrap_or(-1);
        let updated_at = patch
            .updated_at
            .unwrap_or_else(Utc::now)
            .timestamp_millis();

        let result: Option<String> = self
            .scripts
            .update
            .key(&self.config.key_prefix)
            .arg(id)
            .arg(new_status)
            .arg(has_log)
            .arg(log)
            .arg(retry_count)
            .arg(updated_at)
            .invoke_async(&mut conn)
            .await?;

        result.as_deref().map(Self::deserialize).transpose()
    }

    async fn delete_task(&self, id: &str, hard: bool) -> QueueResult<Option<Task>> {
        let mut conn = self.conn.clone();

        let result: Option<String> = self
            .scripts
            .delete
            .key(&self.config.key_prefix)
            .arg(id)
            .arg(if hard { "1" } else { "0" })
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await?;

        if result.is_some() {
            tracing::debug!(task_id = %id, hard, "deleted task");
        }
        result.as_deref().map(Self::deserialize).transpose()
    }

    async fn health_check(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
        if pong != "PONG" {
            return Err(QueueError::storage_message(
                "redis health check failed: unexpected response",
            ));
        }
        Ok(())
    }
}
