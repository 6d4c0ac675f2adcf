//! Mutation dispatcher - issues one batch mutation per chunk.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::clients::{LoadBalancerApi, MutationOp, Submission};
use crate::error::Result;
use crate::model::{AttachmentScope, Target};
use crate::retry::{Retrier, RetryOutcome};

/// Result of dispatching one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Submitted(Submission),
    /// A removal chunk was rejected because its targets are no longer
    /// registered. Nothing is left to do for it.
    AlreadyAbsent,
}

/// Sends chunks to the provider through a [`Retrier`].
pub struct MutationDispatcher<A: LoadBalancerApi> {
    api: Arc<A>,
    retrier: Retrier,
}

impl<A: LoadBalancerApi> MutationDispatcher<A> {
    pub fn new(api: Arc<A>, retrier: Retrier) -> Self {
        Self { api, retrier }
    }

    /// Submit `chunk` as a single `op` call against `scope`.
    ///
    /// The chunk is resent unchanged on transient errors. Callers keep chunks
    /// within the provider's size limit.
    pub async fn dispatch(
        &self,
        scope: &AttachmentScope,
        op: MutationOp,
        chunk: &[Target],
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome> {
        let operation = format!("{} on {}", op, scope);
        debug!(scope = %scope, %op, targets = chunk.len(), "Dispatching chunk");

        let outcome = self
            .retrier
            .call_mutation(&operation, op, cancel, || {
                self.api.submit_mutation(scope, op, chunk)
            })
            .await?;

        Ok(match outcome {
            RetryOutcome::Done(submission) => DispatchOutcome::Submitted(submission),
            RetryOutcome::AlreadyAbsent(_) => DispatchOutcome::AlreadyAbsent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::memory::CallKind;
    use crate::clients::{ApiError, InMemoryLoadBalancer};
    use crate::error::SyncError;
    use crate::retry::{ErrorClassifier, RetryPolicy};
    use std::time::Duration;

    fn dispatcher(api: Arc<InMemoryLoadBalancer>) -> MutationDispatcher<InMemoryLoadBalancer> {
        let policy = RetryPolicy::default()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(10))
            .with_jitter(0.0);
        MutationDispatcher::new(
            api,
            Retrier::new(policy, ErrorClassifier::default(), Duration::from_secs(5)),
        )
    }

    fn scope() -> AttachmentScope {
        AttachmentScope::new("lb-1", "lbl-1", None).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubmits_identical_chunk_on_transient_error() {
        let api = Arc::new(InMemoryLoadBalancer::new().with_task_polls(0));
        api.script(
            CallKind::Submit,
            [
                Some(ApiError::service("FailedOperation.ResourceInOperating", "busy")),
                Some(ApiError::Transport("reset".into())),
            ],
        )
        .await;

        let chunk = vec![
            Target::instance("ins-1", 80).unwrap(),
            Target::instance("ins-2", 80).unwrap(),
        ];
        let outcome = dispatcher(Arc::clone(&api))
            .dispatch(&scope(), MutationOp::Add, &chunk, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Submitted(Submission::Completed));
        let calls = api.mutation_calls().await;
        assert_eq!(calls.len(), 3);
        assert!(calls.windows(2).all(|w| w[0].targets == w[1].targets));
        assert_eq!(api.targets(&scope()).await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_surfaces_after_one_call() {
        let api = Arc::new(InMemoryLoadBalancer::new());
        api.script(
            CallKind::Submit,
            [Some(ApiError::service("UnauthorizedOperation", "denied"))],
        )
        .await;

        let chunk = vec![Target::instance("ins-1", 80).unwrap()];
        let err = dispatcher(Arc::clone(&api))
            .dispatch(&scope(), MutationOp::Add, &chunk, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Fatal { .. }));
        assert_eq!(api.mutation_calls().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_removal_is_not_an_error() {
        let api = Arc::new(InMemoryLoadBalancer::new());
        api.script(
            CallKind::Submit,
            [Some(ApiError::service("InvalidParameter.TargetNotFound", "gone"))],
        )
        .await;

        let chunk = vec![Target::instance("ins-1", 80).unwrap()];
        let outcome = dispatcher(api)
            .dispatch(&scope(), MutationOp::Remove, &chunk, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, DispatchOutcome::AlreadyAbsent);
    }
}
