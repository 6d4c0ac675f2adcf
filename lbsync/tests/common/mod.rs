//! Shared test utilities for lbsync integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lbsync::clients::memory::CallKind;
use lbsync::retry::RetryPolicy;
use lbsync::{
    AttachmentReconciler, AttachmentScope, AttachmentSpec, GateScope, InMemoryLoadBalancer,
    SerializationGate, SyncConfig, Target, TargetSet,
};

pub fn scope(lb: &str) -> AttachmentScope {
    AttachmentScope::new(lb, "lbl-http", None).unwrap()
}

pub fn target(id: &str, port: u16) -> Target {
    Target::instance(id, port).unwrap()
}

/// `n` distinct instance targets on port 80.
pub fn targets(n: usize) -> Vec<Target> {
    (0..n)
        .map(|i| target(&format!("ins-{:03}", i), 80))
        .collect()
}

pub fn set(targets: impl IntoIterator<Item = Target>) -> TargetSet {
    TargetSet::from_targets(targets).unwrap()
}

pub fn spec(scope: AttachmentScope, targets: impl IntoIterator<Item = Target>) -> AttachmentSpec {
    AttachmentSpec::new(scope, set(targets))
}

/// Default config with short, deterministic backoff.
pub fn test_config() -> SyncConfig {
    SyncConfig {
        retry: RetryPolicy::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(0.0),
        ..Default::default()
    }
}

/// An in-memory control plane plus a reconciler wired to it.
pub struct TestLb {
    pub api: Arc<InMemoryLoadBalancer>,
    pub reconciler: AttachmentReconciler<InMemoryLoadBalancer>,
}

impl TestLb {
    pub fn new() -> Self {
        Self::with(InMemoryLoadBalancer::new(), test_config())
    }

    pub fn with(api: InMemoryLoadBalancer, config: SyncConfig) -> Self {
        let api = Arc::new(api);
        let gate = Arc::new(SerializationGate::new(config.gate_scope));
        let reconciler = AttachmentReconciler::new(Arc::clone(&api), gate, &config).unwrap();
        Self { api, reconciler }
    }

    pub fn with_gate_scope(gate_scope: GateScope) -> Self {
        Self::with(
            InMemoryLoadBalancer::new().with_latency(Duration::from_millis(100)),
            SyncConfig {
                gate_scope,
                ..test_config()
            },
        )
    }

    pub async fn describe_count(&self) -> usize {
        self.api
            .calls()
            .await
            .iter()
            .filter(|c| c.kind == CallKind::Describe)
            .count()
    }

    /// Mutating calls as `(op, batch size)`, in order.
    pub async fn mutation_shape(&self) -> Vec<(lbsync::clients::MutationOp, usize)> {
        self.api
            .mutation_calls()
            .await
            .iter()
            .filter_map(|c| c.op.map(|op| (op, c.targets.len())))
            .collect()
    }
}
