//! Serialization gate for mutating reconciliations.
//!
//! The provider rejects overlapping membership changes on the same load
//! balancer, so every mutating reconciliation holds the gate for its whole
//! run. Read-only work does not need it.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::model::AttachmentScope;

/// Granularity of the gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateScope {
    /// One lock for every load balancer in the process.
    #[default]
    Global,
    /// One lock per load balancer id.
    PerLoadBalancer,
}

/// Held for the duration of one reconciliation. Released on drop.
#[derive(Debug)]
pub struct GateGuard {
    _guard: OwnedMutexGuard<()>,
}

pub struct SerializationGate {
    scope: GateScope,
    global: Arc<Mutex<()>>,
    per_lb: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Default for SerializationGate {
    fn default() -> Self {
        Self::new(GateScope::default())
    }
}

impl SerializationGate {
    pub fn new(scope: GateScope) -> Self {
        Self {
            scope,
            global: Arc::new(Mutex::new(())),
            per_lb: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> GateScope {
        self.scope
    }

    async fn lock_for(&self, scope: &AttachmentScope) -> Arc<Mutex<()>> {
        match self.scope {
            GateScope::Global => Arc::clone(&self.global),
            GateScope::PerLoadBalancer => {
                let mut locks = self.per_lb.lock().await;
                // Drop locks no guard or waiter refers to any more.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
                Arc::clone(
                    locks
                        .entry(scope.load_balancer_id().to_string())
                        .or_default(),
                )
            }
        }
    }

    /// Whether one guard covers mutations of both `a` and `b`.
    pub fn shares_lock(&self, a: &AttachmentScope, b: &AttachmentScope) -> bool {
        match self.scope {
            GateScope::Global => true,
            GateScope::PerLoadBalancer => a.load_balancer_id() == b.load_balancer_id(),
        }
    }

    /// Wait for exclusive access to mutate `scope`.
    ///
    /// Returns [`SyncError::Cancelled`] if `cancel` fires while waiting.
    pub async fn acquire(
        &self,
        scope: &AttachmentScope,
        cancel: &CancellationToken,
    ) -> Result<GateGuard> {
        let lock = self.lock_for(scope).await;
        debug!(scope = %scope, "Waiting for serialization gate");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            guard = lock.lock_owned() => Ok(GateGuard { _guard: guard }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn scope(lb: &str) -> AttachmentScope {
        AttachmentScope::new(lb, "lbl-1", None).unwrap()
    }

    #[tokio::test]
    async fn test_global_gate_blocks_other_load_balancers() {
        let gate = SerializationGate::new(GateScope::Global);
        let cancel = CancellationToken::new();

        let _held = gate.acquire(&scope("lb-1"), &cancel).await.unwrap();
        let second = tokio::time::timeout(
            Duration::from_millis(50),
            gate.acquire(&scope("lb-2"), &cancel),
        )
        .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_per_lb_gate_allows_other_load_balancers() {
        let gate = SerializationGate::new(GateScope::PerLoadBalancer);
        let cancel = CancellationToken::new();

        let _held = gate.acquire(&scope("lb-1"), &cancel).await.unwrap();
        assert!(gate.acquire(&scope("lb-2"), &cancel).await.is_ok());

        let same = tokio::time::timeout(
            Duration::from_millis(50),
            gate.acquire(&scope("lb-1"), &cancel),
        )
        .await;
        assert!(same.is_err());
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let gate = SerializationGate::default();
        let cancel = CancellationToken::new();

        drop(gate.acquire(&scope("lb-1"), &cancel).await.unwrap());
        assert!(gate.acquire(&scope("lb-1"), &cancel).await.is_ok());
    }

    #[tokio::test]
    async fn test_per_lb_locks_are_pruned_when_released() {
        let gate = SerializationGate::new(GateScope::PerLoadBalancer);
        let cancel = CancellationToken::new();

        let held = gate.acquire(&scope("lb-1"), &cancel).await.unwrap();
        drop(gate.acquire(&scope("lb-2"), &cancel).await.unwrap());
        drop(gate.acquire(&scope("lb-3"), &cancel).await.unwrap());
        // lb-2 is pruned here; lb-3 stays until the next lookup.
        assert_eq!(gate.per_lb.lock().await.len(), 2);

        drop(gate.acquire(&scope("lb-4"), &cancel).await.unwrap());
        let mut live: Vec<String> = gate.per_lb.lock().await.keys().cloned().collect();
        live.sort();
        assert_eq!(live, vec!["lb-1".to_string(), "lb-4".to_string()]);

        drop(held);
        drop(gate.acquire(&scope("lb-5"), &cancel).await.unwrap());
        assert_eq!(gate.per_lb.lock().await.len(), 1);
    }

    #[test]
    fn test_shares_lock() {
        let global = SerializationGate::new(GateScope::Global);
        assert!(global.shares_lock(&scope("lb-1"), &scope("lb-2")));

        let per_lb = SerializationGate::new(GateScope::PerLoadBalancer);
        assert!(per_lb.shares_lock(
            &scope("lb-1"),
            &AttachmentScope::new("lb-1", "lbl-2", None).unwrap()
        ));
        assert!(!per_lb.shares_lock(&scope("lb-1"), &scope("lb-2")));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let gate = SerializationGate::default();
        let cancel = CancellationToken::new();
        let _held = gate.acquire(&scope("lb-1"), &cancel).await.unwrap();

        let waiter = CancellationToken::new();
        waiter.cancel();
        let err = gate.acquire(&scope("lb-1"), &waiter).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled));
    }
}
