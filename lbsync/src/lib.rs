//! lbsync: reconciles the backend targets attached to load balancer listeners.
//!
//! Given the desired targets of an attachment and the membership the cloud
//! control plane reports, lbsync computes the minimal add/remove/re-weight
//! changes, sends them in provider-sized chunks, and drives every resulting
//! provider task to completion despite throttling, busy resources and stale
//! reads.

pub mod batch;
pub mod clients;
pub mod config;
pub mod diff;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod model;
pub mod poller;
pub mod reconciler;
pub mod retry;

pub use clients::{ApiError, InMemoryLoadBalancer, LoadBalancerApi};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use gate::{GateScope, SerializationGate};
pub use model::{AttachmentScope, AttachmentSpec, Target, TargetSet};
pub use reconciler::attachment::{AttachmentReconciler, AttachmentStatus};
pub use reconciler::Reconciler;
