//! Task records, the status lifecycle, and policy resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::registry::HandlerOptions;

/// Unique identifier for a task
pub type TaskId = String;

/// Hard upper bound on `max_retries`, regardless of overrides.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Status of a task in the queue
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task is waiting to be picked up by a worker
    Pending,
    /// Task has been dequeued and is being executed
    Processing,
    /// Task completed successfully
    Done,
    /// Task failed permanently (handler error or retries exhausted)
    Failed,
    /// Task was soft-deleted; the row is retained for audit
    Deleted,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Done,
        TaskStatus::Failed,
        TaskStatus::Deleted,
    ];

    /// Wire representation (also used in storage key names and SQL rows).
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::Deleted => "deleted",
        }
    }

    /// Whether the lifecycle permits moving from `self` to `next`.
    ///
    /// Permitted: pending→processing, processing→{done, failed, pending},
    /// pending→deleted, done→deleted, failed→deleted. Everything else is
    /// rejected by the engine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Done)
                | (Processing, Failed)
                | (Processing, Pending)
                | (Pending, Deleted)
                | (Done, Deleted)
                | (Failed, Deleted)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "done" => Ok(TaskStatus::Done),
            "failed" => Ok(TaskStatus::Failed),
            "deleted" => Ok(TaskStatus::Deleted),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One unit of work bound to a handler name.
///
/// Timestamps serialize as millisecond integers so durable backends can
/// rewrite them in place (the Redis scripts patch `updated_at` server-side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier, assigned at enqueue
    pub id: TaskId,
    /// Name of the handler this task dispatches to
    pub handler: String,
    /// Opaque payload passed verbatim to the handler
    pub payload: Value,
    /// Current lifecycle status
    pub status: TaskStatus,
    /// Higher priority wins; ties break on older `created_at`, then `id`
    pub priority: i32,
    /// When the task was created
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// When the task was last mutated; for `processing` tasks this is the
    /// dequeue time the stuck detector measures against
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    /// Maximum number of retries before the task fails permanently
    pub max_retries: u32,
    /// Per-attempt processing budget in milliseconds
    pub max_processing_time_ms: u64,
    /// Number of prior failed attempts
    pub retry_count: u32,
    /// Last-failure message, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

impl Task {
    /// Create a pending task with a fresh id and current timestamps.
    pub fn new(
        handler: impl Into<String>,
        payload: Value,
        priority: i32,
        policy: ResolvedPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            handler: handler.into(),
            payload,
            status: TaskStatus::Pending,
            priority,
            created_at: now,
            updated_at: now,
            max_retries: policy.max_retries,
            max_processing_time_ms: policy.max_processing_time_ms,
            retry_count: 0,
            log: None,
        }
    }

    /// A `processing` task is stuck once its last update is strictly older
    /// than its processing budget. An attempt that takes exactly the budget
    /// is not stuck.
    pub fn is_stuck(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Processing
            && (now - self.updated_at).num_milliseconds() > self.max_processing_time_ms as i64
    }
}

/// Total dequeue order: priority descending, then `created_at` ascending,
/// then `id` ascending.
pub fn dequeue_order(a: &Task, b: &Task) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Partial update restricted to the mutable task fields.
///
/// Everything else (`id`, `handler`, `payload`, `priority`, `created_at`,
/// the policy fields) is immutable after enqueue.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub log: Option<String>,
    pub retry_count: Option<u32>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    /// Apply the patch in place. `updated_at` falls back to now so every
    /// mutation refreshes the staleness clock.
    pub fn apply(&self, task: &mut Task) {
        if let Some(status) = self.status {
            task.status = status;
        }
        if let Some(log) = &self.log {
            task.log = Some(log.clone());
        }
        if let Some(retry_count) = self.retry_count {
            task.retry_count = retry_count;
        }
        task.updated_at = self.updated_at.unwrap_or_else(Utc::now);
    }
}

/// Per-enqueue overrides and flags.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    /// Priority override; defaults to 0
    pub priority: Option<i32>,
    /// Retry cap override; must stay within [`MAX_RETRIES_LIMIT`]
    pub max_retries: Option<u32>,
    /// Processing budget override in milliseconds
    pub max_processing_time_ms: Option<u64>,
    /// Reject enqueue when the handler is unknown to this process
    pub strict: bool,
    /// Downgrade a failing payload validation to a warning
    pub skip_on_payload_error: bool,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn max_processing_time_ms(mut self, ms: u64) -> Self {
        self.max_processing_time_ms = Some(ms);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    pub fn skip_on_payload_error(mut self) -> Self {
        self.skip_on_payload_error = true;
        self
    }
}

/// Effective retry/timeout settings for one task, fixed at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub max_retries: u32,
    pub max_processing_time_ms: u64,
}

/// Cascade task-level overrides over handler-level defaults over the
/// engine-level defaults. Called once at enqueue; the result is stored on
/// the task and never re-read mid-attempt.
pub fn resolve_policy(
    options: &TaskOptions,
    handler: Option<&HandlerOptions>,
    config: &QueueConfig,
) -> ResolvedPolicy {
    ResolvedPolicy {
        max_retries: options
            .max_retries
            .or(handler.and_then(|h| h.max_retries))
            .unwrap_or(config.max_retries),
        max_processing_time_ms: options
            .max_processing_time_ms
            .or(handler.and_then(|h| h.max_processing_time_ms))
            .unwrap_or(config.max_processing_time_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use serde_json::json;

    fn policy() -> ResolvedPolicy {
        ResolvedPolicy {
            max_retries: 3,
            max_processing_time_ms: 10_000,
        }
    }

    #[test]
    fn test_new_task_defaults() {
        let task = Task::new("send_email", json!({"to": "a@b.c"}), 5, policy());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.priority, 5);
        assert_eq!(task.max_retries, 3);
        assert!(task.log.is_none());
        assert!(!task.id.is_empty());
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn test_status_transitions() {
        use TaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Done));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Deleted));
        assert!(Done.can_transition_to(Deleted));
        assert!(Failed.can_transition_to(Deleted));

        assert!(!Pending.can_transition_to(Done));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Done.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Deleted));
        assert!(!Deleted.can_transition_to(Pending));
    }

    #[test]
    fn test_status_wire_format() {
        let s = serde_json::to_string(&TaskStatus::Processing).unwrap();
        assert_eq!(s, "\"processing\"");
        let parsed: TaskStatus = serde_json::from_str("\"done\"").unwrap();
        assert_eq!(parsed, TaskStatus::Done);
        assert_eq!("failed".parse::<TaskStatus>().unwrap(), TaskStatus::Failed);
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_task_round_trips_through_json() {
        let task = Task::new("noop", json!({"x": 1}), -2, policy());
        let body = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&body).unwrap();

        assert_eq!(back.id, task.id);
        assert_eq!(back.handler, task.handler);
        assert_eq!(back.payload, task.payload);
        assert_eq!(back.status, task.status);
        assert_eq!(back.priority, task.priority);
        assert_eq!(back.max_retries, task.max_retries);
        assert_eq!(back.max_processing_time_ms, task.max_processing_time_ms);
        assert_eq!(back.retry_count, task.retry_count);
        // millisecond precision on the wire
        assert_eq!(
            back.created_at.timestamp_millis(),
            task.created_at.timestamp_millis()
        );
    }

    #[test]
    fn test_dequeue_order() {
        let mut low = Task::new("noop", json!(null), 0, policy());
        let mut high_old = Task::new("noop", json!(null), 5, policy());
        let mut high_new = Task::new("noop", json!(null), 5, policy());

        let base = Utc::now();
        low.created_at = base;
        high_old.created_at = base - chrono::Duration::seconds(10);
        high_new.created_at = base;

        let mut tasks = vec![&low, &high_new, &high_old];
        tasks.sort_by(|a, b| dequeue_order(a, b));

        assert_eq!(tasks[0].id, high_old.id);
        assert_eq!(tasks[1].id, high_new.id);
        assert_eq!(tasks[2].id, low.id);
    }

    #[test]
    fn test_dequeue_order_id_tiebreak() {
        let mut a = Task::new("noop", json!(null), 1, policy());
        let mut b = Task::new("noop", json!(null), 1, policy());
        let at = Utc::now();
        a.created_at = at;
        b.created_at = at;
        a.id = "aaa".to_string();
        b.id = "bbb".to_string();
        assert_eq!(dequeue_order(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_stuck_uses_strict_greater_than() {
        let mut task = Task::new("slow", json!(null), 0, policy());
        task.status = TaskStatus::Processing;

        let exactly = task.updated_at + chrono::Duration::milliseconds(10_000);
        assert!(!task.is_stuck(exactly));

        let over = task.updated_at + chrono::Duration::milliseconds(10_001);
        assert!(task.is_stuck(over));

        // only processing tasks can be stuck
        task.status = TaskStatus::Pending;
        assert!(!task.is_stuck(over));
    }

    #[test]
    fn test_patch_apply() {
        let mut task = Task::new("noop", json!(null), 0, policy());
        let before = task.updated_at;

        let patch = TaskPatch::new()
            .status(TaskStatus::Processing)
            .retry_count(2)
            .log("boom");
        patch.apply(&mut task);

        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.log.as_deref(), Some("boom"));
        assert!(task.updated_at >= before);
    }

    #[test]
    fn test_policy_resolution_order() {
        let config = QueueConfig::default();

        // engine defaults
        let resolved = resolve_policy(&TaskOptions::new(), None, &config);
        assert_eq!(resolved.max_retries, config.max_retries);
        assert_eq!(resolved.max_processing_time_ms, config.max_processing_time_ms);

        // handler defaults beat engine defaults
        let handler = HandlerOptions {
            max_retries: Some(7),
            max_processing_time_ms: Some(1_234),
            ..Default::default()
        };
        let resolved = resolve_policy(&TaskOptions::new(), Some(&handler), &config);
        assert_eq!(resolved.max_retries, 7);
        assert_eq!(resolved.max_processing_time_ms, 1_234);

        // task overrides beat both
        let options = TaskOptions::new().max_retries(1).max_processing_time_ms(99);
        let resolved = resolve_policy(&options, Some(&handler), &config);
        assert_eq!(resolved.max_retries, 1);
        assert_eq!(resolved.max_processing_time_ms, 99);
    }
}
