//! Provider interface for load balancer target membership.
//!
//! The reconciliation core only needs three calls from the cloud API:
//! - describe the live targets of a scope
//! - submit one batch mutation (add, remove or re-weight targets)
//! - poll the asynchronous task a mutation returned

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{AttachmentScope, Target, TargetSet};

pub use memory::InMemoryLoadBalancer;

/// Error returned by a single provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    /// The request never produced a provider response (connection reset, DNS, TLS).
    #[error("transport error: {0}")]
    Transport(String),

    /// The provider rejected the request with an error code.
    #[error("{code}: {message}")]
    Service {
        code: String,
        message: String,
        request_id: Option<String>,
    },
}

impl ApiError {
    pub fn service(code: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::Service {
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// Provider error code, if the provider answered at all.
    pub fn code(&self) -> Option<&str> {
        match self {
            ApiError::Transport(_) => None,
            ApiError::Service { code, .. } => Some(code),
        }
    }
}

/// Kind of batch mutation submitted for one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MutationOp {
    Add,
    Remove,
    UpdateWeight,
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationOp::Add => "add",
            MutationOp::Remove => "remove",
            MutationOp::UpdateWeight => "update-weight",
        };
        f.write_str(s)
    }
}

/// Opaque identifier of a provider-side asynchronous task.
///
/// Only valid for the lifetime of the call that created it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle(String);

impl TaskHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status of an asynchronous task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed(String),
}

impl TaskStatus {
    /// Map the provider's numeric task status (0 = success, 1 = failed,
    /// 2 = in progress). Unknown codes are treated as still running.
    pub fn from_code(code: i64, detail: impl Into<String>) -> Self {
        match code {
            0 => TaskStatus::Succeeded,
            1 => TaskStatus::Failed(detail.into()),
            _ => TaskStatus::Running,
        }
    }
}

/// What a mutating call handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The provider queued a task that must be polled to completion.
    Async(TaskHandle),
    /// The provider applied the change synchronously.
    Completed,
}

/// Thin cloud API client consumed by the reconciliation core.
#[async_trait]
pub trait LoadBalancerApi: Send + Sync {
    /// Current backend membership of a scope. Eventually consistent.
    async fn describe_live_targets(&self, scope: &AttachmentScope) -> Result<TargetSet, ApiError>;

    /// Issue one batch mutation for at most one chunk of targets.
    async fn submit_mutation(
        &self,
        scope: &AttachmentScope,
        op: MutationOp,
        chunk: &[Target],
    ) -> Result<Submission, ApiError>;

    /// Query a task's status once.
    async fn poll_task(&self, handle: &TaskHandle) -> Result<TaskStatus, ApiError>;
}
