// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for reqexec-core.
//!
//! Each subsystem owns its error enum; this module holds the shared
//! [`ErrorKind`] tag and the engine-boundary [`ExecutionError`].

use thiserror::Error;

use crate::finalize::FinalizeError;
use crate::persistence::StoreError;

/// Classification shared by every error surfaced from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The handler plugin for an operation type could not be located.
    PluginNotFound,
    /// A handler plugin refused to be constructed for its configuration path.
    ContractViolation,
    /// A handler reported failure or crashed while executing.
    ExecutionFailed,
    /// The execution identity could not be obtained (transient).
    IdentityUnavailable,
    /// The request owner has no registered credential (permanent).
    NoCredential,
    /// Finalization retries were exhausted.
    FinalizeExhausted,
    /// The request store failed.
    Store,
}

impl ErrorKind {
    /// Stable error code string for this kind.
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::PluginNotFound => "PLUGIN_NOT_FOUND",
            Self::ContractViolation => "CONTRACT_VIOLATION",
            Self::ExecutionFailed => "EXECUTION_FAILED",
            Self::IdentityUnavailable => "IDENTITY_UNAVAILABLE",
            Self::NoCredential => "NO_CREDENTIAL",
            Self::FinalizeExhausted => "FINALIZE_EXHAUSTED",
            Self::Store => "STORE_ERROR",
        }
    }
}

/// Errors that abort an engine invocation.
///
/// Operation-level problems never show up here; they are reported through
/// [`crate::executor::ExecutionOutcome`] alongside the returned request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExecutionError {
    /// Loading or saving the request failed.
    #[error("request store error: {0}")]
    Store(#[from] StoreError),

    /// The originating job could not be released after all attempts.
    #[error("could not finalize request '{request_name}': {source}")]
    FinalizeExhausted {
        /// Name of the request being finalized.
        request_name: String,
        /// Underlying exhaustion error.
        #[source]
        source: FinalizeError,
    },
}

impl ExecutionError {
    /// Get the error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(_) => ErrorKind::Store,
            Self::FinalizeExhausted { .. } => ErrorKind::FinalizeExhausted,
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        self.kind().as_code()
    }
}
