//! Worker pool: cooperative pollers that drain the queue.
//!
//! Each poller loops dequeue → invoke handler → record outcome. Handler
//! failures are accounted here (emit `taskFailed`, then retry or fail
//! terminally); timeouts are not — a poller whose race timer fires abandons
//! the attempt and leaves the accounting to the stuck detector, so each
//! failed attempt bumps `retry_count` exactly once.
//!
//! Stopping flips an atomic flag and wakes idle sleepers; a handler already
//! in flight is allowed to finish. `stop` returns only after every poller
//! has exited, so no lifecycle event fires after it returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::core::engine::QueueEngine;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventKind, TaskEvent};
use crate::task::{Task, TaskPatch, TaskStatus};

/// Slack added on top of a task's processing budget before the worker
/// abandons the attempt; keeps the race timer from beating the stuck
/// detector's own threshold.
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

/// A fixed-size pool of cooperative pollers over one engine.
pub struct WorkerPool {
    engine: Arc<QueueEngine>,
    active: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(engine: Arc<QueueEngine>) -> Self {
        Self {
            engine,
            active: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Whether pollers are currently running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Launch `concurrency` pollers (at least one).
    pub async fn start(&self, concurrency: usize) -> QueueResult<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(QueueError::AlreadyRunning);
        }

        let concurrency = concurrency.max(1);
        let mut handles = self.handles.lock().await;
        for worker_id in 0..concurrency {
            let engine = Arc::clone(&self.engine);
            let active = Arc::clone(&self.active);
            let shutdown = Arc::clone(&self.shutdown);
            handles.push(tokio::spawn(Self::poll_loop(
                engine, active, shutdown, worker_id,
            )));
        }

        tracing::info!(workers = concurrency, "worker pool started");
        Ok(())
    }

    /// Stop all pollers and wait for them to exit. In-flight handler
    /// invocations finish; no cancellation signal is sent.
    pub async fn stop(&self) -> QueueResult<()> {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        self.shutdown.notify_waiters();

        let handles = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        if !was_active && handles.is_empty() {
            return Err(QueueError::NotRunning);
        }

        for (i, handle) in handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                tracing::error!(worker = i, error = %e, "worker task join error");
            }
        }

        tracing::info!("worker pool stopped");
        Ok(())
    }

    async fn poll_loop(
        engine: Arc<QueueEngine>,
        active: Arc<AtomicBool>,
        shutdown: Arc<Notify>,
        worker_id: usize,
    ) {
        let delay = Duration::from_millis(engine.config().delay_ms);
        tracing::debug!(worker_id, "worker started");

        while active.load(Ordering::SeqCst) {
            let task = match engine.dequeue().await {
                Ok(task) => task,
                Err(e) => {
                    // fatal to this poll only; back off and resume
                    tracing::error!(worker_id, error = %e, "dequeue failed");
                    None
                }
            };

            let Some(task) = task else {
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shutdown.notified() => break,
                }
                continue;
            };

            if let Err(e) = Self::process_task(&engine, task, worker_id).await {
                tracing::error!(worker_id, error = %e, "worker error promoted to fatal, stopping pool");
                active.store(false, Ordering::SeqCst);
                shutdown.notify_waiters();
                break;
            }
        }

        tracing::debug!(worker_id, "worker stopped");
    }

    /// Run one attempt. Returns `Err` only when `crash_on_worker_error`
    /// promotes a handler failure to a pool stop.
    async fn process_task(
        engine: &Arc<QueueEngine>,
        task: Task,
        worker_id: usize,
    ) -> QueueResult<()> {
        let events = engine.events();
        events.emit_task(EventKind::Started, &task);
        tracing::info!(worker_id, task_id = %task.id, handler = %task.handler, "processing task");

        let entry = engine.registry().get(&task.handler);
        let budget = Duration::from_millis(task.max_processing_time_ms) + TIMEOUT_GRACE;

        let outcome = match entry {
            None => Err(QueueError::HandlerNotRegistered {
                handler: task.handler.clone(),
            }),
            Some(entry) => {
                // The handler runs as its own task so a timer fire only
                // detaches from it; the invocation itself is never cancelled.
                let handle = tokio::spawn((entry.func)(task.payload.clone()));
                match timeout(budget, handle).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_error)) => Err(QueueError::handler_failed(format!(
                        "handler panicked: {join_error}"
                    ))),
                    Err(_) => {
                        // Abandon the result; the stuck detector owns timeout
                        // accounting and has already been able to reclaim this
                        // task from another poller.
                        tracing::warn!(
                            worker_id,
                            task_id = %task.id,
                            budget_ms = task.max_processing_time_ms,
                            "handler exceeded its processing budget, abandoning attempt"
                        );
                        if let Err(e) = engine.reclaim_stuck().await {
                            tracing::error!(worker_id, error = %e, "stuck reclamation failed");
                        }
                        return Ok(());
                    }
                }
            }
        };

        match outcome {
            Ok(_) => {
                let patch = TaskPatch::new().status(TaskStatus::Done);
                match engine.update_task(&task.id, patch).await {
                    Ok(Some(updated)) => {
                        tracing::info!(worker_id, task_id = %task.id, "task completed");
                        events.emit_task(EventKind::Completed, &updated);
                    }
                    Ok(None) => {
                        tracing::warn!(worker_id, task_id = %task.id, "task vanished before completion");
                    }
                    Err(e) => {
                        // e.g. the stuck detector reclaimed it mid-flight
                        tracing::error!(worker_id, task_id = %task.id, error = %e, "failed to record completion");
                    }
                }
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                events.emit(&TaskEvent::failed(task.clone(), message.clone()));

                if task.retry_count < task.max_retries {
                    let patch = TaskPatch::new()
                        .status(TaskStatus::Pending)
                        .retry_count(task.retry_count + 1)
                        .log(message.clone());
                    match engine.update_task(&task.id, patch).await {
                        Ok(Some(updated)) => {
                            tracing::warn!(
                                worker_id,
                                task_id = %task.id,
                                retry = updated.retry_count,
                                max_retries = updated.max_retries,
                                %message,
                                "task failed, retrying"
                            );
                            events.emit_task(EventKind::Retried, &updated);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(worker_id, task_id = %task.id, error = %e, "failed to schedule retry");
                        }
                    }
                } else {
                    let patch = TaskPatch::new()
                        .status(TaskStatus::Failed)
                        .log(message.clone());
                    match engine.update_task(&task.id, patch).await {
                        Ok(Some(_)) => {
                            tracing::error!(
                                worker_id,
                                task_id = %task.id,
                                retries = task.retry_count,
                                %message,
                                "task failed permanently"
                            );
                        }
                        Ok(None) => {}
                        Err(e) => {
                            tracing::error!(worker_id, task_id = %task.id, error = %e, "failed to record failure");
                        }
                    }
                }

                if engine.config().crash_on_worker_error {
                    return Err(err);
                }
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
