//! Live-state prefilter for removals.
//!
//! Observed state may be stale by the time a removal chunk is sent, and the
//! provider rejects removals of targets that are not registered. Each removal
//! chunk is therefore narrowed to what is live right before dispatch.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clients::LoadBalancerApi;
use crate::error::{Result, SyncError};
use crate::model::{AttachmentScope, Target, TargetKey, TargetSet};
use crate::retry::Retrier;

/// A removal chunk split by live membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefilterResult {
    /// Targets still registered; these are dispatched.
    pub live: Vec<Target>,
    /// Targets already gone; dropped without error.
    pub already_absent: Vec<TargetKey>,
}

/// Split `candidates` into `candidates ∩ live` and the rest.
pub fn intersect_live(candidates: &[Target], live: &TargetSet) -> PrefilterResult {
    let mut result = PrefilterResult::default();
    for target in candidates {
        let key = target.key();
        if live.contains(&key) {
            result.live.push(target.clone());
        } else {
            result.already_absent.push(key);
        }
    }
    result
}

/// Reads live membership through the retry policy.
pub struct LiveState<A: LoadBalancerApi> {
    api: Arc<A>,
    retrier: Retrier,
}

impl<A: LoadBalancerApi> LiveState<A> {
    pub fn new(api: Arc<A>, retrier: Retrier) -> Self {
        Self { api, retrier }
    }

    /// Current membership of `scope`.
    ///
    /// A load balancer or listener that no longer exists has no members.
    pub async fn fetch(&self, scope: &AttachmentScope, cancel: &CancellationToken) -> Result<TargetSet> {
        let result = self
            .retrier
            .call(&format!("describe {}", scope), cancel, || {
                self.api.describe_live_targets(scope)
            })
            .await;

        match result {
            Err(SyncError::Fatal { source, .. })
                if self.retrier.classifier().is_scope_missing(&source) =>
            {
                info!(scope = %scope, error = %source, "Scope not found, treating as empty");
                Ok(TargetSet::new())
            }
            other => other,
        }
    }

    /// Narrow a removal chunk to the targets that are still live.
    ///
    /// Fails if live state cannot be read; a removal is never sent on
    /// inconclusive state.
    pub async fn prefilter(
        &self,
        scope: &AttachmentScope,
        candidates: &[Target],
        cancel: &CancellationToken,
    ) -> Result<PrefilterResult> {
        let live = self.fetch(scope, cancel).await.map_err(|e| match e {
            SyncError::Cancelled => e,
            other => SyncError::LiveStateUnavailable {
                scope: scope.to_string(),
                source: Box::new(other),
            },
        })?;

        let result = intersect_live(candidates, &live);
        debug!(
            scope = %scope,
            live = result.live.len(),
            absent = result.already_absent.len(),
            "Prefiltered removal chunk"
        );
        Ok(result)
    }
}
