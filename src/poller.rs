use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result, TaskErrorKind};
use crate::models::{TaskStatus, TaskStatusResponse};

const BACKOFF_FACTOR: f64 = 1.5;

/// Limits for [`await_completion`]. `timeout` and `max_attempts` are
/// independent ceilings; whichever is hit first ends the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    /// Default: 120.
    pub max_attempts: u32,
    /// Default: 2s.
    pub initial_interval: Duration,
    /// Default: 10s.
    pub max_interval: Duration,
    /// Default: 20 minutes.
    pub timeout: Duration,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            initial_interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(10),
            timeout: Duration::from_secs(20 * 60),
        }
    }
}

impl PollingPolicy {
    /// Interval to sleep after one of `current` length: ×1.5, capped.
    pub fn next_interval(&self, current: Duration) -> Duration {
        if current >= self.max_interval {
            return self.max_interval;
        }
        Duration::try_from_secs_f64(current.as_secs_f64() * BACKOFF_FACTOR)
            .map_or(self.max_interval, |next| next.min(self.max_interval))
    }
}

/// A single status lookup. Implemented by [`RunwayClient`](crate::RunwayClient).
#[async_trait]
pub trait TaskStatusSource: Send + Sync {
    async fn task_status(&self, task_id: &str) -> Result<TaskStatusResponse>;
}

/// Poll `task_id` until it reaches a terminal status.
///
/// Each iteration checks, in order: the cancellation token, the overall
/// timeout, and the attempt budget, and only then performs one lookup. A
/// failed lookup is logged and still counts as an attempt.
///
/// # Errors
///
/// Every failure is an [`Error::Task`]. For FAILED and CANCELED tasks, and for
/// timeouts or exhausted attempts after at least one successful lookup,
/// [`Error::last_status`] returns the most recent status.
pub async fn await_completion<S: TaskStatusSource + ?Sized>(
    source: &S,
    task_id: &str,
    policy: &PollingPolicy,
    cancel: &CancellationToken,
) -> Result<TaskStatusResponse> {
    let started = Instant::now();
    let mut interval = policy.initial_interval;
    let mut attempts: u32 = 0;
    let mut last_status: Option<TaskStatusResponse> = None;

    loop {
        if cancel.is_cancelled() {
            return Err(task_error(
                TaskErrorKind::Aborted,
                "polling cancelled by caller".into(),
                last_status,
            ));
        }

        if started.elapsed() >= policy.timeout {
            return Err(task_error(
                TaskErrorKind::Timeout(policy.timeout),
                format!("task polling timeout after {:?}", policy.timeout),
                last_status,
            ));
        }

        if attempts >= policy.max_attempts {
            return Err(task_error(
                TaskErrorKind::AttemptsExhausted(policy.max_attempts),
                format!("max polling attempts ({}) exceeded", policy.max_attempts),
                last_status,
            ));
        }

        attempts += 1;

        match source.task_status(task_id).await {
            Ok(status) => {
                tracing::debug!(task_id, status = %status.status, attempt = attempts, "polled task");
                match status.status {
                    TaskStatus::Succeeded => {
                        tracing::info!(task_id, attempts, "task completed successfully");
                        return Ok(status);
                    }
                    TaskStatus::Failed => {
                        let message = format!(
                            "task failed: {}",
                            status.failure_reason().unwrap_or("unknown error")
                        );
                        return Err(task_error(TaskErrorKind::Failed, message, Some(status)));
                    }
                    TaskStatus::Canceled => {
                        return Err(task_error(
                            TaskErrorKind::Canceled,
                            "task was canceled".into(),
                            Some(status),
                        ));
                    }
                    _ => last_status = Some(status),
                }
            }
            Err(e) => {
                tracing::warn!(task_id, attempt = attempts, error = %e, "failed to get task status");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(interval) => {}
        }
        interval = policy.next_interval(interval);
    }
}

fn task_error(
    kind: TaskErrorKind,
    message: String,
    last_status: Option<TaskStatusResponse>,
) -> Error {
    Error::Task {
        kind,
        message,
        last_status: last_status.map(Box::new),
    }
}
