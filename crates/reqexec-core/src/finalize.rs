// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job tracking and request finalization.
//!
//! When a request spawned on behalf of a job completes, the job-tracking
//! service is told it may release the job. The notification is retried a
//! bounded number of times with a fixed pause between attempts.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::ErrorKind;

/// Default number of finalization attempts.
pub const DEFAULT_FINALIZE_ATTEMPTS: u32 = 10;

/// Default pause between finalization attempts.
pub const DEFAULT_FINALIZE_BACKOFF: Duration = Duration::from_secs(10);

/// Errors from the job-tracking service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TrackerError {
    /// The service could not be reached.
    #[error("job tracking service unreachable: {0}")]
    Unreachable(String),

    /// The service refused the call.
    #[error("job tracking service rejected call: {0}")]
    Rejected(String),
}

/// External job-tracking service.
#[async_trait]
pub trait JobTracker: Send + Sync {
    /// Whether the job still exists.
    async fn job_exists(&self, job_id: i64) -> Result<bool, TrackerError>;

    /// Tell the service the request finished and the job may be released.
    async fn release_job(&self, request_id: i64, job_id: i64) -> Result<(), TrackerError>;
}

/// Pause provider, injected so retry loops can be tested without waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Pause for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Bounded retry with a fixed pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, at least one.
    pub max_attempts: u32,
    /// Pause between consecutive attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_FINALIZE_ATTEMPTS,
            backoff: DEFAULT_FINALIZE_BACKOFF,
        }
    }
}

/// Finalization failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum FinalizeError {
    /// Every attempt failed.
    #[error("giving up after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error returned by the last attempt.
        last_error: String,
    },
}

impl FinalizeError {
    /// Get the error classification.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::FinalizeExhausted
    }
}

/// Releases the originating job of a completed request.
#[derive(Clone)]
pub struct FinalizationNotifier {
    tracker: Arc<dyn JobTracker>,
    sleeper: Arc<dyn Sleeper>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for FinalizationNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizationNotifier")
            .field("policy", &self.policy)
            .finish()
    }
}

impl FinalizationNotifier {
    /// Create a notifier.
    pub fn new(tracker: Arc<dyn JobTracker>, sleeper: Arc<dyn Sleeper>, policy: RetryPolicy) -> Self {
        Self {
            tracker,
            sleeper,
            policy,
        }
    }

    /// The retry policy in use.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Release `job_id` for `request_id`, retrying per the policy.
    ///
    /// Returns the number of attempts used. Only the first failure is logged
    /// as a warning; exhaustion is logged as an error and returned.
    pub async fn finalize(
        &self,
        request_id: i64,
        request_name: &str,
        job_id: i64,
    ) -> Result<u32, FinalizeError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.tracker.release_job(request_id, job_id).await {
                Ok(()) => {
                    if attempt > 1 {
                        info!(request_name, job_id, attempt, "Request finalized after retries");
                    } else {
                        info!(request_name, job_id, "Request finalized");
                    }
                    return Ok(attempt);
                }
                Err(e) => {
                    if attempt == 1 {
                        warn!(request_name, job_id, error = %e, "Unable to finalize request, will retry");
                    }
                    if attempt >= max_attempts {
                        error!(request_name, job_id, attempts = attempt, "Giving up finalizing request");
                        return Err(FinalizeError::Exhausted {
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    debug!(
                        attempt,
                        backoff_secs = self.policy.backoff.as_secs(),
                        "Waiting before next finalization attempt"
                    );
                    self.sleeper.sleep(self.policy.backoff).await;
                }
            }
        }
    }
}
