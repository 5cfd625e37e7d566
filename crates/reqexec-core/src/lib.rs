// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request Execution Engine
//!
//! This crate drives persisted data-management requests to completion. A
//! request is an ordered list of operations (replicate, remove, register,
//! ...), each of which may touch many files. The engine runs the next
//! pending operation through a pluggable handler under the request owner's
//! delegated credential, keeps going until the request is finished or
//! blocked, saves it, and tells the job-tracking service when a job's
//! request is done.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Scheduling agent                                │
//! │                (picks Waiting requests, calls execute)                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          RequestExecutor                                 │
//! │     resolve identity ─► run operations in order ─► save ─► finalize      │
//! └─────────────────────────────────────────────────────────────────────────┘
//!      │                     │                     │                 │
//!      ▼                     ▼                     ▼                 ▼
//! ┌──────────────┐  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────┐
//! │ Credential   │  │ HandlerRegistry │  │  RequestStore   │  │ JobTracker  │
//! │ Resolver     │  │ (per session)   │  │ (SQLite/memory) │  │             │
//! └──────────────┘  └─────────────────┘  └─────────────────┘  └─────────────┘
//! ```
//!
//! # Request State Machine
//!
//! ```text
//!            ┌──────────────┐  every operation Done   ┌──────────┐
//!            │   Waiting    │────────────────────────►│   Done   │
//!            └──────────────┘                         └──────────┘
//!                   │
//!                   │ operation Failed, or owner has no credential
//!                   ▼
//!            ┌──────────────┐
//!            │    Failed    │
//!            └──────────────┘
//! ```
//!
//! Request status is derived from its operations taken in order: the first
//! operation that is not Done decides. Done and Failed requests are never
//! touched again.
//!
//! ## Pass outcomes
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | `AlreadyTerminal` | Request was Done or Failed on entry |
//! | `Completed` | All operations Done, request saved, job released |
//! | `Waiting` | An operation is Waiting or Scheduled on something external |
//! | `Failed` | An operation failed, or the owner has no credential |
//! | `Interrupted` | Identity or handler unavailable, or a handler crashed |
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `REQEXEC_DATABASE_URL` | (required) | SQLite URL of the request store |
//! | `REQEXEC_CONFIG_PATH` | `/Systems/RequestManagement/Agents/RequestExecutingAgent` | Base handler configuration path |
//! | `REQEXEC_OPERATION_HANDLERS` | (empty) | `Type=plugin/path,...` routing table |
//! | `REQEXEC_SHIFTERS` | (empty) | `Role=user:group,...` shifter definitions |
//! | `REQEXEC_CREDENTIAL_MIN_VALIDITY_SECS` | `1200` | Minimum credential lifetime |
//! | `REQEXEC_CREDENTIAL_CACHE_SECS` | `172800` | Credential caching hint |
//! | `REQEXEC_FINALIZE_MAX_ATTEMPTS` | `10` | Finalization attempts |
//! | `REQEXEC_FINALIZE_BACKOFF_SECS` | `10` | Pause between finalization attempts |
//!
//! A loaded [`Config`] is applied in two places: shifters and the credential
//! policy through [`CredentialResolver::from_config`], everything else
//! through [`RequestExecutorBuilder::from_config`].
//!
//! ```rust,ignore
//! let config = Config::from_env()?;
//! let resolver = CredentialResolver::from_config(directory, issuer, &config);
//! let executor = RequestExecutor::builder()
//!     .from_config(&config)
//!     .store(store)
//!     .resolver(Arc::new(resolver))
//!     .catalog(Arc::new(catalog))
//!     .job_tracker(tracker)
//!     .build()?;
//! ```

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Owner identity resolution and delegated credentials.
pub mod credentials;

/// Error types with stable error codes.
pub mod error;

/// The request execution engine.
pub mod executor;

/// Job release with bounded retry.
pub mod finalize;

/// Operation handler contract, catalog, and per-session registry.
pub mod handlers;

/// Named counters.
pub mod metrics;

/// Embedded database migrations.
pub mod migrations;

/// Request storage backends.
pub mod persistence;

/// Request, operation, and file data model.
pub mod request;

/// Tracing subscriber setup.
pub mod telemetry;

pub use config::Config;
pub use credentials::{CredentialResolver, ResolvedIdentity};
pub use error::{ErrorKind, ExecutionError};
pub use executor::{
    Execution, ExecutionOutcome, Interruption, RequestExecutor, RequestExecutorBuilder,
};
pub use finalize::{FinalizationNotifier, JobTracker, RetryPolicy, Sleeper};
pub use handlers::{ExecutionContext, HandlerCatalog, HandlerError, OperationHandler};
pub use metrics::{InMemoryMetrics, MetricsSink};
pub use persistence::{InMemoryRequestStore, RequestStore, SqliteRequestStore, StoreError};
pub use request::{FileStatus, Operation, OperationFile, OperationStatus, Request, RequestStatus};
