//! Attachment reconciler - converges the backend targets bound to one
//! listener or forwarding rule.
//!
//! One call holds the serialization gate from the first describe to the last
//! poll. Removals run first (each chunk narrowed to live state right before
//! it is sent), then additions, then weight updates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::prefilter::LiveState;
use super::Reconciler;
use crate::batch::{self, PlannedChunk};
use crate::clients::{LoadBalancerApi, MutationOp, Submission};
use crate::config::SyncConfig;
use crate::diff::{diff, TargetDiff};
use crate::dispatch::{DispatchOutcome, MutationDispatcher};
use crate::error::{ChunkFailure, ChunkReport, PartialApplication, Result, SyncError};
use crate::gate::SerializationGate;
use crate::model::{AttachmentScope, AttachmentSpec, Target, TargetKey, TargetSet};
use crate::poller::TaskPoller;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentPhase {
    /// Live membership matches the spec.
    Ready,
    /// Changes were applied but live state does not show all of them yet.
    Converging,
}

/// Report of one reconciliation.
#[derive(Debug, Clone)]
pub struct AttachmentStatus {
    pub run_id: Uuid,
    pub scope: AttachmentScope,
    pub phase: AttachmentPhase,
    pub message: Option<String>,
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    /// Removal candidates that were already gone.
    pub already_absent: Vec<TargetKey>,
    pub chunks: Vec<ChunkReport>,
    /// Keys that still differ from the spec after read-back.
    pub unconverged: Vec<TargetKey>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl AttachmentStatus {
    pub fn is_ready(&self) -> bool {
        self.phase == AttachmentPhase::Ready
    }
}

/// Reconciler for load balancer target attachments.
pub struct AttachmentReconciler<A: LoadBalancerApi> {
    gate: Arc<SerializationGate>,
    live: LiveState<A>,
    dispatcher: MutationDispatcher<A>,
    poller: TaskPoller<A>,
    chunk_size: usize,
    verify_after_apply: bool,
}

impl<A: LoadBalancerApi> AttachmentReconciler<A> {
    /// Build a reconciler. Reconcilers that may touch the same load balancer
    /// must share `gate`.
    pub fn new(api: Arc<A>, gate: Arc<SerializationGate>, config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let retrier = config.retrier();

        Ok(Self {
            gate,
            live: LiveState::new(Arc::clone(&api), retrier.clone()),
            dispatcher: MutationDispatcher::new(Arc::clone(&api), retrier.clone()),
            poller: TaskPoller::new(api, retrier, config.poll.clone()),
            chunk_size: config.chunk_size,
            verify_after_apply: config.verify_after_apply,
        })
    }

    /// Compute the chunks a reconcile would send, without mutating anything.
    pub async fn plan(
        &self,
        spec: &AttachmentSpec,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlannedChunk>> {
        let observed = self.live.fetch(&spec.scope, cancel).await?;
        Ok(batch::plan(&diff(&spec.targets, &observed), self.chunk_size))
    }

    /// Move an attachment from `old` to `new`.
    ///
    /// Scope fields cannot change in place: a different scope drains `old`
    /// completely before `new` is registered. When one gate lock covers both
    /// scopes it is held across both steps. Otherwise each step takes its own
    /// lock in turn.
    pub async fn replace(
        &self,
        old: &AttachmentSpec,
        new: &AttachmentSpec,
        cancel: &CancellationToken,
    ) -> Result<AttachmentStatus> {
        let run_id = Uuid::new_v4();
        let reconcile_span = info_span!("reconcile", %run_id, scope = %new.scope);

        if !old.scope.requires_replace(&new.scope) {
            return self
                .converge(run_id, new, cancel)
                .instrument(reconcile_span)
                .await;
        }

        info!(from = %old.scope, to = %new.scope, "Scope changed, replacing attachment");
        let finalize_span = info_span!("finalize", scope = %old.scope);

        if self.gate.shares_lock(&old.scope, &new.scope) {
            let _guard = self.gate.acquire(&old.scope, cancel).await?;
            self.drain_locked(old, cancel).instrument(finalize_span).await?;
            return self
                .converge_locked(run_id, new, cancel)
                .instrument(reconcile_span)
                .await;
        }

        self.drain(old, cancel).instrument(finalize_span).await?;
        self.converge(run_id, new, cancel)
            .instrument(reconcile_span)
            .await
    }

    async fn converge(
        &self,
        run_id: Uuid,
        spec: &AttachmentSpec,
        cancel: &CancellationToken,
    ) -> Result<AttachmentStatus> {
        let _guard = self.gate.acquire(&spec.scope, cancel).await?;
        self.converge_locked(run_id, spec, cancel).await
    }

    /// Converge `spec`. The caller holds the gate for its scope.
    async fn converge_locked(
        &self,
        run_id: Uuid,
        spec: &AttachmentSpec,
        cancel: &CancellationToken,
    ) -> Result<AttachmentStatus> {
        let started_at = Utc::now();
        let scope = &spec.scope;
        info!(
            "Reconciling attachment {} ({} desired targets)",
            scope,
            spec.targets.len()
        );

        let observed = self.live.fetch(scope, cancel).await?;
        let changes = diff(&spec.targets, &observed);
        if changes.is_empty() {
            info!("Attachment {} already converged", scope);
            return Ok(build_status(run_id, scope, vec![], vec![], None, started_at));
        }

        info!(
            add = changes.add.len(),
            remove = changes.remove.len(),
            update = changes.update.len(),
            "Applying changes to {}",
            scope
        );
        let chunks = self
            .apply(scope, batch::plan(&changes, self.chunk_size), cancel)
            .await?;

        let (unconverged, note) = if self.verify_after_apply {
            match self.verify(scope, &spec.targets, cancel).await {
                Ok(keys) => (keys, None),
                Err(SyncError::Cancelled) => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!(scope = %scope, error = %e, "Read-back verification failed");
                    (vec![], Some(format!("changes applied, verification failed: {}", e)))
                }
            }
        } else {
            (vec![], None)
        };

        Ok(build_status(run_id, scope, chunks, unconverged, note, started_at))
    }

    async fn drain(&self, spec: &AttachmentSpec, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.gate.acquire(&spec.scope, cancel).await?;
        self.drain_locked(spec, cancel).await
    }

    /// Remove the targets `spec` owns. The caller holds the gate for its scope.
    async fn drain_locked(&self, spec: &AttachmentSpec, cancel: &CancellationToken) -> Result<()> {
        let scope = &spec.scope;
        info!(
            "Finalizing (draining) attachment {} ({} targets)",
            scope,
            spec.targets.len()
        );

        let drain = TargetDiff {
            remove: spec.targets.to_vec(),
            ..Default::default()
        };
        let reports = self
            .apply(scope, batch::plan(&drain, self.chunk_size), cancel)
            .await?;

        let removed: usize = reports.iter().map(|r| r.dispatched.len()).sum();
        info!(scope = %scope, removed, "Attachment drained");
        Ok(())
    }

    /// Run planned chunks in order, stopping at the first failure.
    async fn apply(
        &self,
        scope: &AttachmentScope,
        planned: Vec<PlannedChunk>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChunkReport>> {
        let mut completed = Vec::with_capacity(planned.len());
        let mut pending = planned.into_iter();

        while let Some(chunk) = pending.next() {
            match self.apply_chunk(scope, &chunk, cancel).await {
                Ok(report) => completed.push(report),
                Err(cause) => {
                    let not_attempted: Vec<_> = pending.map(|c| c.to_ref()).collect();
                    if completed.is_empty() && not_attempted.is_empty() {
                        return Err(cause);
                    }

                    error!(
                        scope = %scope,
                        chunk = %chunk.to_ref(),
                        error = %cause,
                        "Chunk failed, {} completed, {} not attempted",
                        completed.len(),
                        not_attempted.len()
                    );
                    return Err(SyncError::PartialApplication(Box::new(PartialApplication {
                        completed,
                        failed: ChunkFailure {
                            chunk: chunk.to_ref(),
                            cause,
                        },
                        not_attempted,
                    })));
                }
            }
        }

        Ok(completed)
    }

    async fn apply_chunk(
        &self,
        scope: &AttachmentScope,
        chunk: &PlannedChunk,
        cancel: &CancellationToken,
    ) -> Result<ChunkReport> {
        let mut report = ChunkReport {
            op: chunk.op,
            index: chunk.index,
            dispatched: vec![],
            already_absent: vec![],
            task: None,
            polls: 0,
        };

        let mut targets = if chunk.op == MutationOp::Remove {
            let filtered = self.live.prefilter(scope, &chunk.targets, cancel).await?;
            for key in &filtered.already_absent {
                info!(scope = %scope, key = %key, "Target already absent, skipping removal");
            }
            report.already_absent = filtered.already_absent;
            filtered.live
        } else {
            chunk.targets.clone()
        };

        if targets.is_empty() {
            return Ok(report);
        }

        let mut outcome = self.dispatcher.dispatch(scope, chunk.op, &targets, cancel).await?;

        // The rejection may name only some of the chunk; resend what is live.
        if matches!(outcome, DispatchOutcome::AlreadyAbsent) && targets.len() > 1 {
            let refreshed = self.live.prefilter(scope, &targets, cancel).await?;
            report.already_absent.extend(refreshed.already_absent);
            targets = refreshed.live;
            if targets.is_empty() {
                return Ok(report);
            }
            warn!(
                scope = %scope,
                chunk = %chunk.to_ref(),
                live = targets.len(),
                "Removal chunk rejected as absent, resending live targets"
            );
            outcome = self.dispatcher.dispatch(scope, chunk.op, &targets, cancel).await?;
        }

        let keys: Vec<TargetKey> = targets.iter().map(Target::key).collect();
        match outcome {
            DispatchOutcome::AlreadyAbsent => report.already_absent.extend(keys),
            DispatchOutcome::Submitted(Submission::Completed) => report.dispatched = keys,
            DispatchOutcome::Submitted(Submission::Async(task)) => {
                let summary = self.poller.wait(&task, cancel).await?;
                report.dispatched = keys;
                report.task = Some(task);
                report.polls = summary.polls;
            }
        }

        Ok(report)
    }

    /// Keys whose live state still differs from `desired`.
    async fn verify(
        &self,
        scope: &AttachmentScope,
        desired: &TargetSet,
        cancel: &CancellationToken,
    ) -> Result<Vec<TargetKey>> {
        let live = self.live.fetch(scope, cancel).await?;
        let remaining = diff(desired, &live);
        let keys: Vec<TargetKey> = remaining
            .add
            .iter()
            .chain(&remaining.remove)
            .chain(&remaining.update)
            .map(Target::key)
            .collect();

        if !keys.is_empty() {
            warn!(scope = %scope, unconverged = keys.len(), "Live state has not converged yet");
        }
        Ok(keys)
    }
}

fn build_status(
    run_id: Uuid,
    scope: &AttachmentScope,
    chunks: Vec<ChunkReport>,
    unconverged: Vec<TargetKey>,
    note: Option<String>,
    started_at: DateTime<Utc>,
) -> AttachmentStatus {
    let count = |op: MutationOp| -> usize {
        chunks
            .iter()
            .filter(|c| c.op == op)
            .map(|c| c.dispatched.len())
            .sum()
    };
    let added = count(MutationOp::Add);
    let removed = count(MutationOp::Remove);
    let updated = count(MutationOp::UpdateWeight);
    let already_absent = chunks
        .iter()
        .flat_map(|c| c.already_absent.iter().cloned())
        .collect();

    let (phase, message) = match note {
        Some(note) => (AttachmentPhase::Converging, Some(note)),
        None if !unconverged.is_empty() => (
            AttachmentPhase::Converging,
            Some(format!(
                "{} target(s) not yet reflected in live state",
                unconverged.len()
            )),
        ),
        None => (AttachmentPhase::Ready, None),
    };

    AttachmentStatus {
        run_id,
        scope: scope.clone(),
        phase,
        message,
        added,
        removed,
        updated,
        already_absent,
        chunks,
        unconverged,
        started_at,
        finished_at: Utc::now(),
    }
}

#[async_trait]
impl<A: LoadBalancerApi> Reconciler for AttachmentReconciler<A> {
    type Spec = AttachmentSpec;
    type Status = AttachmentStatus;

    async fn reconcile(
        &self,
        spec: &Self::Spec,
        cancel: &CancellationToken,
    ) -> Result<Self::Status> {
        let run_id = Uuid::new_v4();
        self.converge(run_id, spec, cancel)
            .instrument(info_span!("reconcile", %run_id, scope = %spec.scope))
            .await
    }

    async fn finalize(&self, spec: &Self::Spec, cancel: &CancellationToken) -> Result<()> {
        self.drain(spec, cancel)
            .instrument(info_span!("finalize", scope = %spec.scope))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::InMemoryLoadBalancer;
    use crate::gate::GateScope;

    fn scope() -> AttachmentScope {
        AttachmentScope::new("lb-1", "lbl-1", None).unwrap()
    }

    fn set(ids: &[&str]) -> TargetSet {
        TargetSet::from_targets(ids.iter().map(|id| Target::instance(*id, 80).unwrap())).unwrap()
    }

    fn reconciler(api: Arc<InMemoryLoadBalancer>) -> AttachmentReconciler<InMemoryLoadBalancer> {
        AttachmentReconciler::new(
            api,
            Arc::new(SerializationGate::new(GateScope::Global)),
            &SyncConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_converged_attachment_issues_no_mutations() {
        let api = Arc::new(InMemoryLoadBalancer::new());
        api.seed(&scope(), &set(&["A", "B"])).await;

        let status = reconciler(Arc::clone(&api))
            .reconcile(&AttachmentSpec::new(scope(), set(&["A", "B"])), &CancellationToken::new())
            .await
            .unwrap();

        assert!(status.is_ready());
        assert!(status.chunks.is_empty());
        assert!(api.mutation_calls().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_counts_changes() {
        let api = Arc::new(InMemoryLoadBalancer::new());
        api.seed(&scope(), &set(&["B", "C"])).await;

        let mut desired = set(&["A"]);
        desired.upsert(Target::instance("B", 80).unwrap().with_weight(50).unwrap());

        let status = reconciler(Arc::clone(&api))
            .reconcile(&AttachmentSpec::new(scope(), desired.clone()), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!((status.added, status.removed, status.updated), (1, 1, 1));
        assert!(status.is_ready());
        assert_eq!(api.targets(&scope()).await, desired);
        assert!(status.finished_at >= status.started_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_back_reports_lagging_state() {
        let api = Arc::new(InMemoryLoadBalancer::new());
        // First describe sees the real (empty) state, the read-back a stale one.
        api.queue_stale_snapshot(TargetSet::new()).await;
        api.queue_stale_snapshot(TargetSet::new()).await;

        let status = reconciler(Arc::clone(&api))
            .reconcile(&AttachmentSpec::new(scope(), set(&["A"])), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(status.phase, AttachmentPhase::Converging);
        assert_eq!(status.unconverged, vec![Target::instance("A", 80).unwrap().key()]);
        assert_eq!(status.added, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_plan_does_not_mutate() {
        let api = Arc::new(InMemoryLoadBalancer::new());
        api.seed(&scope(), &set(&["C"])).await;

        let planned = reconciler(Arc::clone(&api))
            .plan(&AttachmentSpec::new(scope(), set(&["A", "B"])), &CancellationToken::new())
            .await
            .unwrap();

        let ops: Vec<MutationOp> = planned.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![MutationOp::Remove, MutationOp::Add]);
        assert!(api.mutation_calls().await.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SyncConfig {
            chunk_size: 0,
            ..Default::default()
        };
        let result = AttachmentReconciler::new(
            Arc::new(InMemoryLoadBalancer::new()),
            Arc::new(SerializationGate::default()),
            &config,
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }
}
