//! In-process load balancer control plane.
//!
//! Behaves like the provider where the reconciliation core cares: chunk size
//! limits, asynchronous tasks that take a number of polls to finish, removals
//! of unknown targets rejected with `InvalidParameter`, and eventually
//! consistent describes. Failures and hung requests can be scripted per call
//! kind. Used by the `simulate` command and by tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{ApiError, LoadBalancerApi, MutationOp, Submission, TaskHandle, TaskStatus};
use crate::batch::DEFAULT_CHUNK_SIZE;
use crate::model::{AttachmentScope, Target, TargetKey, TargetSet};

/// Provider call kinds that can be scripted and are recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    Describe,
    Submit,
    Poll,
}

/// One call the fake received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub kind: CallKind,
    pub op: Option<MutationOp>,
    pub scope: Option<AttachmentScope>,
    pub targets: Vec<TargetKey>,
}

// Provider task status codes.
const TASK_SUCCEEDED: i64 = 0;
const TASK_FAILED: i64 = 1;
const TASK_RUNNING: i64 = 2;

#[derive(Debug)]
struct TaskProgress {
    polls_left: u32,
    code: i64,
    detail: String,
}

#[derive(Debug, Default)]
struct Inner {
    attachments: HashMap<AttachmentScope, BTreeMap<TargetKey, Target>>,
    tasks: HashMap<TaskHandle, TaskProgress>,
    scripted: HashMap<CallKind, VecDeque<Option<ApiError>>>,
    stalls: HashMap<CallKind, VecDeque<Duration>>,
    stale_snapshots: VecDeque<TargetSet>,
    failing_tasks: VecDeque<String>,
    calls: Vec<RecordedCall>,
    next_task: u64,
    in_flight: usize,
    max_in_flight: usize,
}

impl Inner {
    fn next_scripted(&mut self, kind: CallKind) -> Option<ApiError> {
        self.scripted.get_mut(&kind).and_then(VecDeque::pop_front).flatten()
    }

    fn next_stall(&mut self, kind: CallKind) -> Option<Duration> {
        self.stalls.get_mut(&kind).and_then(VecDeque::pop_front)
    }
}

async fn stall_for(delay: Option<Duration>) {
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
}

/// In-memory implementation of [`LoadBalancerApi`].
pub struct InMemoryLoadBalancer {
    inner: Mutex<Inner>,
    chunk_limit: usize,
    task_polls: u32,
    latency: Duration,
}

impl Default for InMemoryLoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLoadBalancer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            chunk_limit: DEFAULT_CHUNK_SIZE,
            task_polls: 1,
            latency: Duration::ZERO,
        }
    }

    /// Reject mutations carrying more than `limit` targets.
    pub fn with_chunk_limit(mut self, limit: usize) -> Self {
        self.chunk_limit = limit;
        self
    }

    /// Number of polls before a task reports its outcome. Zero makes every
    /// mutation synchronous.
    pub fn with_task_polls(mut self, polls: u32) -> Self {
        self.task_polls = polls;
        self
    }

    /// Simulated duration of each mutating call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Replace the live membership of a scope.
    pub async fn seed(&self, scope: &AttachmentScope, targets: &TargetSet) {
        let mut inner = self.inner.lock().await;
        inner.attachments.insert(
            scope.clone(),
            targets.iter().map(|t| (t.key(), t.clone())).collect(),
        );
    }

    /// Drop a target behind the reconciler's back, as when its instance is
    /// terminated by another process.
    pub async fn evict(&self, scope: &AttachmentScope, key: &TargetKey) -> bool {
        let mut inner = self.inner.lock().await;
        inner
            .attachments
            .get_mut(scope)
            .and_then(|members| members.remove(key))
            .is_some()
    }

    /// Script the outcome of the next calls of `kind`: `Some(err)` fails the
    /// call, `None` lets it through.
    pub async fn script<I>(&self, kind: CallKind, outcomes: I)
    where
        I: IntoIterator<Item = Option<ApiError>>,
    {
        let mut inner = self.inner.lock().await;
        inner.scripted.entry(kind).or_default().extend(outcomes);
    }

    /// Make the next call of `kind` hang for `delay` before it is served.
    /// The call is recorded when it arrives.
    pub async fn stall(&self, kind: CallKind, delay: Duration) {
        self.inner.lock().await.stalls.entry(kind).or_default().push_back(delay);
    }

    /// Make the next describe return `snapshot` instead of the live state.
    pub async fn queue_stale_snapshot(&self, snapshot: TargetSet) {
        self.inner.lock().await.stale_snapshots.push_back(snapshot);
    }

    /// Make the next submitted task end in failure with `detail`.
    pub async fn fail_next_task(&self, detail: impl Into<String>) {
        self.inner.lock().await.failing_tasks.push_back(detail.into());
    }

    /// Current live membership of a scope.
    pub async fn targets(&self, scope: &AttachmentScope) -> TargetSet {
        let inner = self.inner.lock().await;
        let mut set = TargetSet::new();
        if let Some(members) = inner.attachments.get(scope) {
            for target in members.values() {
                set.upsert(target.clone());
            }
        }
        set
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.inner.lock().await.calls.clone()
    }

    /// Recorded mutating calls, in order.
    pub async fn mutation_calls(&self) -> Vec<RecordedCall> {
        self.calls()
            .await
            .into_iter()
            .filter(|c| c.kind == CallKind::Submit)
            .collect()
    }

    pub async fn poll_count(&self) -> usize {
        self.calls()
            .await
            .iter()
            .filter(|c| c.kind == CallKind::Poll)
            .count()
    }

    /// Highest number of mutating calls that were in flight at once.
    pub async fn max_concurrent_mutations(&self) -> usize {
        self.inner.lock().await.max_in_flight
    }

    fn apply(
        members: &mut BTreeMap<TargetKey, Target>,
        op: MutationOp,
        chunk: &[Target],
    ) -> Result<(), ApiError> {
        match op {
            MutationOp::Add => {
                for target in chunk {
                    members.insert(target.key(), target.clone());
                }
            }
            MutationOp::Remove | MutationOp::UpdateWeight => {
                if let Some(missing) = chunk.iter().find(|t| !members.contains_key(&t.key())) {
                    return Err(ApiError::service(
                        "InvalidParameter",
                        format!("target {} is not bound to the listener", missing.key()),
                    ));
                }
                for target in chunk {
                    if op == MutationOp::Remove {
                        members.remove(&target.key());
                    } else {
                        members.insert(target.key(), target.clone());
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LoadBalancerApi for InMemoryLoadBalancer {
    async fn describe_live_targets(&self, scope: &AttachmentScope) -> Result<TargetSet, ApiError> {
        let delay = {
            let mut inner = self.inner.lock().await;
            inner.calls.push(RecordedCall {
                kind: CallKind::Describe,
                op: None,
                scope: Some(scope.clone()),
                targets: vec![],
            });
            inner.next_stall(CallKind::Describe)
        };
        stall_for(delay).await;

        {
            let mut inner = self.inner.lock().await;
            if let Some(err) = inner.next_scripted(CallKind::Describe) {
                return Err(err);
            }
            if let Some(snapshot) = inner.stale_snapshots.pop_front() {
                debug!(scope = %scope, "Serving stale snapshot");
                return Ok(snapshot);
            }
        }
        Ok(self.targets(scope).await)
    }

    async fn submit_mutation(
        &self,
        scope: &AttachmentScope,
        op: MutationOp,
        chunk: &[Target],
    ) -> Result<Submission, ApiError> {
        let delay = {
            let mut inner = self.inner.lock().await;
            inner.calls.push(RecordedCall {
                kind: CallKind::Submit,
                op: Some(op),
                scope: Some(scope.clone()),
                targets: chunk.iter().map(Target::key).collect(),
            });
            inner.next_stall(CallKind::Submit)
        };
        stall_for(delay).await;

        {
            let mut inner = self.inner.lock().await;
            if let Some(err) = inner.next_scripted(CallKind::Submit) {
                return Err(err);
            }
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut inner = self.inner.lock().await;
        inner.in_flight -= 1;

        if chunk.len() > self.chunk_limit {
            return Err(ApiError::service(
                "LimitExceeded",
                format!("at most {} targets per request", self.chunk_limit),
            ));
        }

        let members = inner.attachments.entry(scope.clone()).or_default();
        Self::apply(members, op, chunk)?;

        if self.task_polls == 0 {
            return Ok(Submission::Completed);
        }

        inner.next_task += 1;
        let handle = TaskHandle::new(format!("task-{:04}", inner.next_task));
        let (code, detail) = match inner.failing_tasks.pop_front() {
            Some(detail) => (TASK_FAILED, detail),
            None => (TASK_SUCCEEDED, String::new()),
        };
        inner.tasks.insert(
            handle.clone(),
            TaskProgress {
                polls_left: self.task_polls,
                code,
                detail,
            },
        );
        Ok(Submission::Async(handle))
    }

    async fn poll_task(&self, handle: &TaskHandle) -> Result<TaskStatus, ApiError> {
        let delay = {
            let mut inner = self.inner.lock().await;
            inner.calls.push(RecordedCall {
                kind: CallKind::Poll,
                op: None,
                scope: None,
                targets: vec![],
            });
            inner.next_stall(CallKind::Poll)
        };
        stall_for(delay).await;

        let mut inner = self.inner.lock().await;
        if let Some(err) = inner.next_scripted(CallKind::Poll) {
            return Err(err);
        }

        let task = inner.tasks.get_mut(handle).ok_or_else(|| {
            ApiError::service("InvalidParameter", format!("task {} does not exist", handle))
        })?;
        task.polls_left = task.polls_left.saturating_sub(1);
        let code = if task.polls_left == 0 {
            task.code
        } else {
            TASK_RUNNING
        };
        Ok(TaskStatus::from_code(code, task.detail.clone()))
    }
}
