//! Reconcilers for attachment resources.
//!
//! A reconciler compares desired state (the attachment spec) with actual state
//! (live membership reported by the provider) and takes actions to converge.

pub mod attachment;
pub mod prefilter;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Trait for resource reconcilers.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Desired state of the resource.
    type Spec: Send + Sync;
    /// The status type to report back.
    type Status: Send;

    /// Reconcile the resource - compare desired vs actual state and take action.
    async fn reconcile(&self, spec: &Self::Spec, cancel: &CancellationToken) -> Result<Self::Status>;

    /// Handle resource deletion (finalization).
    async fn finalize(&self, spec: &Self::Spec, cancel: &CancellationToken) -> Result<()>;
}
