// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request execution engine.
//!
//! [`RequestExecutor`] drives one request at a time: it resolves the owner's
//! identity, runs the lowest-order Waiting operation through its handler,
//! classifies the outcome, and repeats until the request leaves Waiting or
//! no further progress is possible in this pass. A Done request is saved and,
//! when it belongs to a job, finalized.
//!
//! # Example
//!
//! ```rust,ignore
//! let executor = RequestExecutor::builder()
//!     .store(store)
//!     .resolver(resolver)
//!     .catalog(catalog)
//!     .job_tracker(tracker)
//!     .build()?;
//!
//! let execution = executor.execute_by_id(42).await?;
//! println!("{:?}", execution.outcome);
//! ```

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use futures::FutureExt;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::credentials::{CredentialResolver, ResolveError};
use crate::error::ExecutionError;
use crate::finalize::{FinalizationNotifier, JobTracker, RetryPolicy, Sleeper, TokioSleeper};
use crate::handlers::{ExecutionContext, HandlerCatalog, HandlerError, HandlerRegistry};
use crate::metrics::{InMemoryMetrics, MetricsSink};
use crate::persistence::RequestStore;
use crate::request::{OperationStatus, Request, RequestStatus};

/// Counter: requests handed to the engine.
pub const REQUEST_ATTEMPTED: &str = "request.attempted";
/// Counter: failed handler invocations.
pub const REQUEST_FAILED: &str = "request.failed";
/// Counter: requests completed and saved.
pub const REQUEST_DONE: &str = "request.done";

/// Request-level error recorded when the originating job is gone.
pub const ORPHANED_JOB_ERROR: &str = "owning job no longer exists";

/// Why a pass stopped early without reaching a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Interruption {
    /// The identity could not be resolved; nothing was touched.
    IdentityUnavailable(ResolveError),
    /// The handler for the current operation could not be loaded.
    HandlerUnavailable(HandlerError),
    /// The handler panicked while executing.
    HandlerCrashed(String),
}

/// How an engine invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The request was already Done or Failed; nothing ran.
    AlreadyTerminal(RequestStatus),
    /// Every operation is Done and the request was saved.
    Completed {
        /// Finalization attempts used, when the request belongs to a job.
        finalize_attempts: Option<u32>,
    },
    /// An operation is waiting on something external; try again later.
    Waiting,
    /// The request ended Failed.
    Failed,
    /// The pass stopped early; the request is left for a later pass.
    Interrupted(Interruption),
}

/// Result of one engine invocation.
#[derive(Debug, Clone)]
pub struct Execution {
    /// The request as left by the engine.
    pub request: Request,
    /// How the invocation ended.
    pub outcome: ExecutionOutcome,
}

impl Execution {
    fn new(request: Request, outcome: ExecutionOutcome) -> Self {
        Self { request, outcome }
    }
}

/// Builder for creating a [`RequestExecutor`].
pub struct RequestExecutorBuilder {
    store: Option<Arc<dyn RequestStore>>,
    resolver: Option<Arc<CredentialResolver>>,
    catalog: Option<Arc<HandlerCatalog>>,
    job_tracker: Option<Arc<dyn JobTracker>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    sleeper: Option<Arc<dyn Sleeper>>,
    finalize_policy: RetryPolicy,
    config_path: String,
    routes: BTreeMap<String, String>,
}

impl std::fmt::Debug for RequestExecutorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutorBuilder")
            .field("store", &self.store.as_ref().map(|_| "..."))
            .field("resolver", &self.resolver)
            .field("catalog", &self.catalog)
            .field("job_tracker", &self.job_tracker.as_ref().map(|_| "..."))
            .field("finalize_policy", &self.finalize_policy)
            .field("config_path", &self.config_path)
            .field("routes", &self.routes)
            .finish()
    }
}

impl Default for RequestExecutorBuilder {
    fn default() -> Self {
        Self {
            store: None,
            resolver: None,
            catalog: None,
            job_tracker: None,
            metrics: None,
            sleeper: None,
            finalize_policy: RetryPolicy::default(),
            config_path: DEFAULT_CONFIG_PATH.to_string(),
            routes: BTreeMap::new(),
        }
    }
}

impl RequestExecutorBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the settings carried by a loaded [`Config`].
    ///
    /// The configured operation routes are added to the catalog at build
    /// time and take precedence over routes already in it. Shifters and the
    /// credential policy belong to the resolver; see
    /// [`CredentialResolver::from_config`].
    pub fn from_config(mut self, config: &Config) -> Self {
        self.config_path = config.config_path.clone();
        self.finalize_policy = config.finalize_policy;
        self.routes.extend(
            config
                .operation_handlers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self
    }

    /// Set the request store (required).
    pub fn store(mut self, store: Arc<dyn RequestStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the credential resolver (required).
    pub fn resolver(mut self, resolver: Arc<CredentialResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Set the handler catalog (required).
    pub fn catalog(mut self, catalog: Arc<HandlerCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Set the job-tracking service (required).
    pub fn job_tracker(mut self, job_tracker: Arc<dyn JobTracker>) -> Self {
        self.job_tracker = Some(job_tracker);
        self
    }

    /// Set the metrics sink.
    ///
    /// Default: a fresh [`InMemoryMetrics`]
    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the sleeper used between finalization attempts.
    ///
    /// Default: [`TokioSleeper`]
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Set the finalization retry policy.
    pub fn finalize_policy(mut self, policy: RetryPolicy) -> Self {
        self.finalize_policy = policy;
        self
    }

    /// Set the base configuration path handed to handlers.
    ///
    /// Default: `/Systems/RequestManagement/Agents/RequestExecutingAgent`
    pub fn config_path(mut self, config_path: impl Into<String>) -> Self {
        self.config_path = config_path.into();
        self
    }

    /// Build the executor.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<RequestExecutor> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let resolver = self
            .resolver
            .ok_or_else(|| anyhow::anyhow!("resolver is required"))?;
        let mut catalog = self
            .catalog
            .ok_or_else(|| anyhow::anyhow!("catalog is required"))?;
        if !self.routes.is_empty() {
            catalog = Arc::new(catalog.as_ref().clone().with_routes(self.routes));
        }
        let job_tracker = self
            .job_tracker
            .ok_or_else(|| anyhow::anyhow!("job_tracker is required"))?;
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(InMemoryMetrics::new()));
        let sleeper = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));

        metrics.register_counter(REQUEST_ATTEMPTED, "Requests processed");
        metrics.register_counter(REQUEST_FAILED, "Requests failed");
        metrics.register_counter(REQUEST_DONE, "Requests done");

        let notifier = FinalizationNotifier::new(job_tracker.clone(), sleeper, self.finalize_policy);

        Ok(RequestExecutor {
            store,
            resolver,
            catalog,
            job_tracker,
            notifier,
            metrics,
            config_path: self.config_path,
        })
    }
}

/// Drives persisted requests to a terminal state.
///
/// An executor holds no per-request state and can serve many requests
/// concurrently; each call to [`execute`](Self::execute) opens its own
/// handler session.
pub struct RequestExecutor {
    store: Arc<dyn RequestStore>,
    resolver: Arc<CredentialResolver>,
    catalog: Arc<HandlerCatalog>,
    job_tracker: Arc<dyn JobTracker>,
    notifier: FinalizationNotifier,
    metrics: Arc<dyn MetricsSink>,
    config_path: String,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("resolver", &self.resolver)
            .field("catalog", &self.catalog)
            .field("notifier", &self.notifier)
            .field("config_path", &self.config_path)
            .finish()
    }
}

impl RequestExecutor {
    /// Create a new builder for configuring the executor.
    pub fn builder() -> RequestExecutorBuilder {
        RequestExecutorBuilder::new()
    }

    /// Get a reference to the request store.
    pub fn store(&self) -> &Arc<dyn RequestStore> {
        &self.store
    }

    /// Get a reference to the metrics sink.
    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Load a request from the store and execute it.
    pub async fn execute_by_id(&self, request_id: i64) -> Result<Execution, ExecutionError> {
        let request = self.store.load(request_id).await?;
        self.execute(request).await
    }

    /// Execute a request until it is terminal or blocked.
    ///
    /// Operation-level failures are reported through the returned
    /// [`ExecutionOutcome`]; only store failures and finalization exhaustion
    /// surface as errors.
    #[instrument(skip(self, request), fields(request_name = %request.request_name, request_id = ?request.request_id))]
    pub async fn execute(&self, mut request: Request) -> Result<Execution, ExecutionError> {
        if request.status.is_terminal() {
            debug!(status = request.status.as_str(), "Request already terminal, nothing to do");
            let status = request.status;
            return Ok(Execution::new(request, ExecutionOutcome::AlreadyTerminal(status)));
        }

        debug!("About to execute request");
        self.metrics.increment(REQUEST_ATTEMPTED);

        let identity = match self
            .resolver
            .resolve(&request.owner_subject, &request.owner_group)
            .await
        {
            Ok(identity) => identity,
            Err(e) if e.is_permanent() => {
                error!(error = %e, "Owner has no credential, request set to Failed");
                self.metrics.flush();
                request.fail_all(e.to_string());
                return Ok(Execution::new(request, ExecutionOutcome::Failed));
            }
            Err(e) => {
                error!(error = %e, "Unable to resolve execution identity");
                self.metrics.flush();
                return Ok(Execution::new(
                    request,
                    ExecutionOutcome::Interrupted(Interruption::IdentityUnavailable(e)),
                ));
            }
        };

        let ctx = ExecutionContext::new(&request, identity);
        let interruption = self.run_operations(&mut request, &ctx).await;
        self.metrics.flush();

        if let Some(interruption) = interruption {
            return Ok(Execution::new(request, ExecutionOutcome::Interrupted(interruption)));
        }

        match request.status {
            RequestStatus::Done => self.complete(request).await,
            RequestStatus::Failed => {
                info!(error = ?request.error, "Request failed");
                Ok(Execution::new(request, ExecutionOutcome::Failed))
            }
            RequestStatus::Waiting => {
                debug!("Request still waiting");
                Ok(Execution::new(request, ExecutionOutcome::Waiting))
            }
        }
    }

    /// Run Waiting operations in order until the request leaves Waiting or
    /// the pass cannot continue.
    async fn run_operations(&self, request: &mut Request, ctx: &ExecutionContext) -> Option<Interruption> {
        let mut registry = HandlerRegistry::new(&self.catalog, &self.config_path, self.metrics.as_ref());

        while request.refresh_status() == RequestStatus::Waiting {
            let Some(index) = request.first_waiting() else {
                debug!("No waiting operation left in this pass");
                break;
            };
            let op = &request.operations()[index];
            let (operation_type, order) = (op.operation_type.clone(), op.order);
            info!(order, operation_type = %operation_type, "Executing operation");

            let handler = match registry.get_handler(&operation_type) {
                Ok(handler) => handler,
                Err(e) => {
                    error!(operation_type = %operation_type, error = %e, "Unable to process operation");
                    if let Some(op) = request.operation_mut(index) {
                        op.error = Some(e.to_string());
                    }
                    return Some(Interruption::HandlerUnavailable(e));
                }
            };
            let counters = handler.counters.clone();
            self.metrics.increment(&counters.attempted);

            let Some(op) = request.operation_mut(index) else {
                break;
            };
            let result = AssertUnwindSafe(handler.execute(op, ctx)).catch_unwind().await;

            let returned_error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    error!(operation_type = %operation_type, panic = %message, "Handler crashed");
                    self.metrics.increment(&counters.failed);
                    self.metrics.increment(REQUEST_FAILED);
                    op.error = Some(format!("handler crashed: {message}"));
                    return Some(Interruption::HandlerCrashed(message));
                }
            };

            if let Some(e) = &returned_error {
                error!(operation_type = %operation_type, error = %e, "Unable to process operation");
                op.error = Some(e.to_string());
            }

            let status = op.status;
            if returned_error.is_some() || status == OperationStatus::Failed {
                self.metrics.increment(&counters.failed);
                self.metrics.increment(REQUEST_FAILED);
                if let Some(job_id) = request.job_id {
                    self.fail_if_orphaned(request, index, job_id).await;
                }
            } else if status == OperationStatus::Done {
                self.metrics.increment(&counters.succeeded);
            }

            let status = request.operations()[index].status;
            if matches!(status, OperationStatus::Waiting | OperationStatus::Scheduled) {
                debug!(order, status = status.as_str(), "Operation not finished, stopping pass");
                break;
            }
        }

        request.refresh_status();
        None
    }

    /// Fail the operation at `index` when the request's job no longer exists.
    async fn fail_if_orphaned(&self, request: &mut Request, index: usize, job_id: i64) {
        match self.job_tracker.job_exists(job_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id, "Job does not exist anymore, failing operation");
                if let Some(op) = request.operation_mut(index) {
                    op.fail_all();
                }
                request.error = Some(ORPHANED_JOB_ERROR.to_string());
            }
            Err(e) => {
                error!(job_id, error = %e, "Failed to get job status");
            }
        }
    }

    /// Save a Done request and finalize its job, if any.
    async fn complete(&self, mut request: Request) -> Result<Execution, ExecutionError> {
        info!("Updating request with status Done");
        let request_id = self.store.save(&request).await.map_err(|e| {
            error!(error = %e, "Unable to save request");
            e
        })?;
        request.request_id = Some(request_id);
        self.metrics.increment(REQUEST_DONE);
        info!(request_id, "Request is done");

        let finalize_attempts = match request.job_id {
            Some(job_id) => {
                let attempts = self
                    .notifier
                    .finalize(request_id, &request.request_name, job_id)
                    .await
                    .map_err(|source| ExecutionError::FinalizeExhausted {
                        request_name: request.request_name.clone(),
                        source,
                    })?;
                Some(attempts)
            }
            None => None,
        };

        Ok(Execution::new(
            request,
            ExecutionOutcome::Completed { finalize_attempts },
        ))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
