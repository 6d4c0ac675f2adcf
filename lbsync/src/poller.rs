//! Async task poller.
//!
//! Waits for a provider task to reach a terminal state. The first poll is
//! immediate; after that the task is queried once per interval until it
//! succeeds, fails, the overall deadline passes or the caller cancels.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clients::{LoadBalancerApi, TaskHandle, TaskStatus};
use crate::error::{Result, SyncError};
use crate::retry::Retrier;

/// Polling cadence and deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

/// How a successful wait went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSummary {
    pub task: TaskHandle,
    pub polls: u32,
    pub elapsed: Duration,
}

pub struct TaskPoller<A: LoadBalancerApi> {
    api: Arc<A>,
    retrier: Retrier,
    config: PollConfig,
}

impl<A: LoadBalancerApi> TaskPoller<A> {
    pub fn new(api: Arc<A>, retrier: Retrier, config: PollConfig) -> Self {
        Self {
            api,
            retrier,
            config,
        }
    }

    /// Poll `handle` until it finishes.
    ///
    /// Transient poll errors are retried without resubmitting the mutation.
    /// Hitting the deadline returns [`SyncError::Timeout`]; the task may still
    /// complete on the provider side.
    pub async fn wait(&self, handle: &TaskHandle, cancel: &CancellationToken) -> Result<PollSummary> {
        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut polls: u32 = 0;

        let poll_loop = async {
            loop {
                polls += 1;
                let status = self
                    .retrier
                    .call(&format!("poll task {}", handle), cancel, || {
                        self.api.poll_task(handle)
                    })
                    .await?;

                match status {
                    TaskStatus::Succeeded => return Ok::<u32, SyncError>(polls),
                    TaskStatus::Failed(detail) => {
                        return Err(SyncError::TaskFailed {
                            task: handle.clone(),
                            detail,
                        })
                    }
                    TaskStatus::Pending | TaskStatus::Running => {
                        debug!(task = %handle, polls, "Task still running");
                    }
                }

                tokio::time::sleep(self.config.interval).await;
            }
        };

        let polls = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(SyncError::Timeout {
                    operation: format!("task {}", handle),
                    after: self.config.timeout,
                })
            }
            result = poll_loop => result?,
        };

        let elapsed = started.elapsed();
        info!(task = %handle, polls, ?elapsed, "Task finished");
        Ok(PollSummary {
            task: handle.clone(),
            polls,
            elapsed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::CallKind;
    use crate::clients::{ApiError, InMemoryLoadBalancer, MutationOp, Submission};
    use crate::model::{AttachmentScope, Target};
    use crate::retry::{ErrorClassifier, RetryPolicy};

    fn poller(api: Arc<InMemoryLoadBalancer>, timeout: Duration) -> TaskPoller<InMemoryLoadBalancer> {
        let retrier = Retrier::new(
            RetryPolicy::default()
                .with_initial_delay(Duration::from_millis(100))
                .with_jitter(0.0),
            ErrorClassifier::default(),
            Duration::from_secs(5),
        );
        TaskPoller::new(
            api,
            retrier,
            PollConfig {
                interval: Duration::from_secs(1),
                timeout,
            },
        )
    }

    async fn submit(api: &InMemoryLoadBalancer) -> TaskHandle {
        let scope = AttachmentScope::new("lb-1", "lbl-1", None).unwrap();
        let chunk = [Target::instance("ins-1", 80).unwrap()];
        match api.submit_mutation(&scope, MutationOp::Add, &chunk).await.unwrap() {
            Submission::Async(handle) => handle,
            Submission::Completed => panic!("expected async task"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_running_succeeded_takes_three_polls() {
        let api = Arc::new(InMemoryLoadBalancer::new().with_task_polls(3));
        let handle = submit(&api).await;

        let summary = poller(Arc::clone(&api), Duration::from_secs(600))
            .wait(&handle, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.polls, 3);
        assert_eq!(api.poll_count().await, 3);
        assert_eq!(summary.elapsed, Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_terminal_times_out_at_deadline() {
        let api = Arc::new(InMemoryLoadBalancer::new().with_task_polls(u32::MAX));
        let handle = submit(&api).await;
        let started = Instant::now();

        let err = poller(api, Duration::from_secs(10))
            .wait(&handle, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Timeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task() {
        let api = Arc::new(InMemoryLoadBalancer::new().with_task_polls(2));
        api.fail_next_task("backend rejected").await;
        let handle = submit(&api).await;

        let err = poller(api, Duration::from_secs(600))
            .wait(&handle, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            SyncError::TaskFailed { detail, .. } => assert_eq!(detail, "backend rejected"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_poll_error_is_retried() {
        let api = Arc::new(InMemoryLoadBalancer::new().with_task_polls(1));
        let handle = submit(&api).await;
        api.script(CallKind::Poll, [Some(ApiError::Transport("reset".into()))])
            .await;

        let summary = poller(Arc::clone(&api), Duration::from_secs(600))
            .wait(&handle, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.polls, 1);
        assert_eq!(api.poll_count().await, 2);
        assert_eq!(api.mutation_calls().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_poll_request_is_retried() {
        let api = Arc::new(InMemoryLoadBalancer::new().with_task_polls(1));
        let handle = submit(&api).await;
        api.stall(CallKind::Poll, Duration::from_secs(3600)).await;

        let summary = poller(Arc::clone(&api), Duration::from_secs(600))
            .wait(&handle, &CancellationToken::new())
            .await
            .unwrap();

        // 5s call deadline, then one 100ms backoff.
        assert_eq!(summary.elapsed, Duration::from_millis(5100));
        assert_eq!(api.poll_count().await, 2);
        assert_eq!(api.mutation_calls().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_polls_stop_at_poll_deadline() {
        let api = Arc::new(InMemoryLoadBalancer::new().with_task_polls(1));
        let handle = submit(&api).await;
        for _ in 0..10 {
            api.stall(CallKind::Poll, Duration::from_secs(3600)).await;
        }
        let started = Instant::now();

        let err = poller(api, Duration::from_secs(12))
            .wait(&handle, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Timeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let api = Arc::new(InMemoryLoadBalancer::new().with_task_polls(u32::MAX));
        let handle = submit(&api).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            trigger.cancel();
        });

        let err = poller(Arc::clone(&api), Duration::from_secs(600))
            .wait(&handle, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
        assert_eq!(api.poll_count().await, 3);
    }
}
