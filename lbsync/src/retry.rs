//! Retry policy and error classification for provider calls.
//!
//! Implements bounded exponential backoff with jitter. Every provider call made
//! by the dispatcher, the poller and the live-state reader goes through a
//! [`Retrier`], which combines a [`RetryPolicy`], an [`ErrorClassifier`] and a
//! per-call deadline.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clients::{ApiError, MutationOp};
use crate::error::{Result, SyncError};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub multiplier: f64,
    /// Wall-clock budget across all attempts of one call
    pub budget: Duration,
    /// Relative jitter applied to each delay (0.1 = ±10%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            budget: Duration::from_secs(5 * 60),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (1 = first retry). Zero for 0.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let factor = if self.jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };

        Duration::try_from_secs_f64((capped * factor).max(0.0)).unwrap_or(self.max_delay)
    }

    /// Whether another attempt may start after `attempts` failed ones, given
    /// that it would start once `elapsed` has passed since the first attempt.
    pub fn should_retry(&self, attempts: u32, elapsed: Duration) -> bool {
        attempts < self.max_attempts && elapsed <= self.budget
    }
}

/// How a provider error is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry locally with backoff.
    Transient,
    /// The removal target is already gone; treat as success.
    AlreadyAbsent,
    /// Surface immediately.
    Fatal,
}

/// Maps provider error codes to an [`ErrorClass`].
///
/// A configured code matches itself and any dotted sub-code, so
/// `RequestLimitExceeded` also covers `RequestLimitExceeded.UinLimitExceeded`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorClassifier {
    /// Throttling, busy and in-progress codes.
    pub retryable_codes: Vec<String>,
    /// Codes meaning a removal target is not (or no longer) registered.
    pub absent_codes: Vec<String>,
    /// Codes meaning the load balancer or listener itself does not exist.
    pub scope_missing_codes: Vec<String>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        let codes = |list: &[&str]| -> Vec<String> { list.iter().map(|c| c.to_string()).collect() };
        Self {
            retryable_codes: codes(&[
                "InternalError",
                "RequestLimitExceeded",
                "FailedOperation.ResourceInOperating",
                "ResourceInUse",
                "ResourceUnavailable",
            ]),
            absent_codes: codes(&[
                "InvalidParameter.TargetNotFound",
                "FailedOperation.TargetNotRegistered",
                "ResourceNotFound",
            ]),
            scope_missing_codes: codes(&[
                "InvalidParameter.LBIdNotFound",
                "InvalidParameter.ListenerIdNotFound",
            ]),
        }
    }
}

fn code_matches(configured: &[String], code: &str) -> bool {
    configured.iter().any(|c| {
        code == c.as_str()
            || code
                .strip_prefix(c.as_str())
                .is_some_and(|rest| rest.starts_with('.'))
    })
}

impl ErrorClassifier {
    /// Classify `err` raised by a call for `op` (`None` for reads and polls).
    ///
    /// Only removals can be [`ErrorClass::AlreadyAbsent`].
    pub fn classify(&self, err: &ApiError, op: Option<MutationOp>) -> ErrorClass {
        let code = match err {
            ApiError::Transport(_) => return ErrorClass::Transient,
            ApiError::Service { code, .. } => code.as_str(),
        };

        if code_matches(&self.retryable_codes, code) {
            ErrorClass::Transient
        } else if op == Some(MutationOp::Remove) && code_matches(&self.absent_codes, code) {
            ErrorClass::AlreadyAbsent
        } else {
            ErrorClass::Fatal
        }
    }

    /// Whether `err` says the whole load balancer or listener is gone.
    pub fn is_scope_missing(&self, err: &ApiError) -> bool {
        err.code()
            .is_some_and(|code| code_matches(&self.scope_missing_codes, code))
    }
}

/// Result of a retried call.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Done(T),
    /// A removal hit an already-absent code; carries the provider error.
    AlreadyAbsent(ApiError),
}

/// Drives one provider call through deadline, classification and backoff.
#[derive(Debug, Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    classifier: ErrorClassifier,
    call_timeout: Duration,
}

impl Retrier {
    pub fn new(policy: RetryPolicy, classifier: ErrorClassifier, call_timeout: Duration) -> Self {
        Self {
            policy,
            classifier,
            call_timeout,
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Run a read or poll call. Already-absent codes are not special here.
    pub async fn call<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        match self.run(operation, None, cancel, call).await? {
            RetryOutcome::Done(value) => Ok(value),
            RetryOutcome::AlreadyAbsent(source) => Err(SyncError::Fatal {
                operation: operation.to_string(),
                source,
            }),
        }
    }

    /// Run a mutating call for `op`.
    pub async fn call_mutation<T, F, Fut>(
        &self,
        operation: &str,
        op: MutationOp,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<RetryOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        self.run(operation, Some(op), cancel, call).await
    }

    async fn run<T, F, Fut>(
        &self,
        operation: &str,
        op: Option<MutationOp>,
        cancel: &CancellationToken,
        mut call: F,
    ) -> Result<RetryOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ApiError>>,
    {
        let started = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                r = tokio::time::timeout(self.call_timeout, call()) => r,
            };

            let err = match result {
                Ok(Ok(value)) => return Ok(RetryOutcome::Done(value)),
                Ok(Err(err)) => err,
                // A mutation that overran may still have been applied.
                Err(_) if op.is_some() => {
                    return Err(SyncError::Timeout {
                        operation: operation.to_string(),
                        after: self.call_timeout,
                    })
                }
                Err(_) => ApiError::Transport(format!(
                    "no response within {:?}",
                    self.call_timeout
                )),
            };

            match self.classifier.classify(&err, op) {
                ErrorClass::AlreadyAbsent => {
                    debug!(operation, error = %err, "Target already absent");
                    return Ok(RetryOutcome::AlreadyAbsent(err));
                }
                ErrorClass::Fatal => {
                    return Err(SyncError::Fatal {
                        operation: operation.to_string(),
                        source: err,
                    })
                }
                ErrorClass::Transient => {}
            }

            let delay = self.policy.delay_for_retry(attempts);
            if !self.policy.should_retry(attempts, started.elapsed() + delay) {
                return Err(SyncError::RetryExhausted {
                    operation: operation.to_string(),
                    attempts,
                    last: err,
                });
            }

            warn!(
                operation,
                attempt = attempts,
                error = %err,
                "Transient error, retrying in {:?}",
                delay
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
