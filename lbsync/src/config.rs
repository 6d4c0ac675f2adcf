//! Reconciliation settings.
//!
//! Durations use serde's native representation (`{"secs": 30, "nanos": 0}`).
//! Every field has a default, so a config file only needs the overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::batch::DEFAULT_CHUNK_SIZE;
use crate::error::{Result, SyncError};
use crate::gate::GateScope;
use crate::poller::PollConfig;
use crate::retry::{ErrorClassifier, Retrier, RetryPolicy};

/// Upper bound for a single call deadline or backoff delay.
const MAX_STEP: Duration = Duration::from_secs(60 * 60);
/// Upper bound for the retry budget and the task wait.
const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Targets per mutating call.
    pub chunk_size: usize,
    /// Deadline for a single provider call.
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
    pub poll: PollConfig,
    pub gate_scope: GateScope,
    /// Re-read live membership after applying and report what did not converge.
    pub verify_after_apply: bool,
    pub classifier: ErrorClassifier,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            call_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            poll: PollConfig::default(),
            gate_scope: GateScope::default(),
            verify_after_apply: true,
            classifier: ErrorClassifier::default(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SyncConfig =
            serde_json::from_str(json).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(SyncError::Config(msg.to_string()));

        if self.chunk_size == 0 {
            return invalid("chunk_size must be at least 1");
        }
        if self.call_timeout.is_zero() {
            return invalid("call_timeout must be positive");
        }
        if self.call_timeout > MAX_STEP {
            return invalid("call_timeout must not exceed 1h");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be finite and >= 1.0");
        }
        if self.retry.max_delay > MAX_STEP {
            return invalid("retry.max_delay must not exceed 1h");
        }
        if self.retry.budget > MAX_WAIT {
            return invalid("retry.budget must not exceed 24h");
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be in [0, 1)");
        }
        if self.poll.interval.is_zero() {
            return invalid("poll.interval must be positive");
        }
        if self.poll.timeout < self.poll.interval {
            return invalid("poll.timeout must not be shorter than poll.interval");
        }
        if self.poll.timeout > MAX_WAIT {
            return invalid("poll.timeout must not exceed 24h");
        }
        Ok(())
    }

    /// Retrier shared by every provider call of one reconciler.
    pub fn retrier(&self) -> Retrier {
        Retrier::new(
            self.retry.clone(),
            self.classifier.clone(),
            self.call_timeout,
        )
    }
}
