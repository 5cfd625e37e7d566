// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for reqexec-core integration tests.
//!
//! Provides scripted collaborators (issuer, job tracker, sleeper, handlers)
//! and a TestContext that wires them into a RequestExecutor.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use reqexec_core::credentials::{
    Credential, CredentialIssuer, CredentialResolver, IssueError, IssueRequest, ShifterSpec,
    StaticDirectory,
};
use reqexec_core::finalize::{JobTracker, RetryPolicy, Sleeper, TrackerError};
use reqexec_core::handlers::{ExecutionContext, HandlerCatalog, HandlerError, OperationHandler};
use reqexec_core::metrics::InMemoryMetrics;
use reqexec_core::persistence::{InMemoryRequestStore, RequestStore};
use reqexec_core::request::{FileStatus, Operation, OperationStatus};
use reqexec_core::{Config, RequestExecutor};

pub const OWNER_SUBJECT: &str = "/DC=org/DC=example/CN=Alice";
pub const OWNER_GROUP: &str = "alice_user";

/// Issuer that hands out credentials for registered owners only.
#[derive(Default)]
pub struct FakeIssuer {
    registered: Mutex<HashSet<(String, String)>>,
    outage: AtomicBool,
    pub issued: Mutex<Vec<IssueRequest>>,
}

impl FakeIssuer {
    pub fn register(&self, subject: &str, group: &str) {
        self.registered
            .lock()
            .unwrap()
            .insert((subject.to_string(), group.to_string()));
    }

    /// Make every issuance fail with a transient error.
    pub fn set_outage(&self, outage: bool) {
        self.outage.store(outage, Ordering::SeqCst);
    }
}

pub fn credential_path(group: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/x509up_{group}"))
}

#[async_trait]
impl CredentialIssuer for FakeIssuer {
    async fn issue_delegated(&self, request: &IssueRequest) -> Result<Credential, IssueError> {
        self.issued.lock().unwrap().push(request.clone());
        if self.outage.load(Ordering::SeqCst) {
            return Err(IssueError::Unavailable("proxy manager timed out".to_string()));
        }
        let key = (request.subject.clone(), request.group.clone());
        if !self.registered.lock().unwrap().contains(&key) {
            return Err(IssueError::NotRegistered {
                subject: request.subject.clone(),
                group: request.group.clone(),
            });
        }
        Ok(Credential {
            path: credential_path(&request.group),
            subject: request.subject.clone(),
            group: request.group.clone(),
            voms_attribute: request.voms_attribute.clone(),
        })
    }
}

/// Job tracker with a fixed liveness answer and a scripted release.
pub struct ScriptedTracker {
    job_alive: bool,
    liveness_error: bool,
    release_failures: u32,
    pub exists_calls: Mutex<Vec<i64>>,
    pub release_calls: AtomicU32,
}

impl ScriptedTracker {
    pub fn new(job_alive: bool, release_failures: u32) -> Self {
        Self {
            job_alive,
            liveness_error: false,
            release_failures,
            exists_calls: Mutex::new(Vec::new()),
            release_calls: AtomicU32::new(0),
        }
    }

    /// Make every liveness check fail.
    pub fn with_liveness_error(mut self) -> Self {
        self.liveness_error = true;
        self
    }

    pub fn releases(&self) -> u32 {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn liveness_checks(&self) -> Vec<i64> {
        self.exists_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobTracker for ScriptedTracker {
    async fn job_exists(&self, job_id: i64) -> Result<bool, TrackerError> {
        self.exists_calls.lock().unwrap().push(job_id);
        if self.liveness_error {
            return Err(TrackerError::Unreachable("job service timed out".to_string()));
        }
        Ok(self.job_alive)
    }

    async fn release_job(&self, _request_id: i64, _job_id: i64) -> Result<(), TrackerError> {
        let call = self.release_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.release_failures {
            Err(TrackerError::Unreachable(format!("release attempt {call} failed")))
        } else {
            Ok(())
        }
    }
}

/// Sleeper that records durations without waiting.
#[derive(Default)]
pub struct RecordingSleeper {
    pub sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
    }
}

/// What a scripted handler does with its operation.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Mark the operation and its files Done.
    Complete,
    /// Set the operation to the given non-terminal status.
    Leave(OperationStatus),
    /// Return an error without touching the operation.
    Error(String),
    /// Mark the operation Failed and return Ok.
    MarkFailed,
    /// Mark the first file Done, then the operation Failed.
    FailAfterFirstFile,
    /// Panic with the given message.
    Panic(String),
}

/// One handler invocation as seen by a scripted handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub operation_type: String,
    pub order: u32,
    pub credential: PathBuf,
    pub shifters: Vec<String>,
    pub config_path: String,
}

/// What scripted handlers record: their invocations and how many handler
/// instances were constructed.
#[derive(Clone, Default)]
pub struct HandlerLog {
    pub invocations: Arc<Mutex<Vec<Invocation>>>,
    pub constructed: Arc<AtomicUsize>,
}

struct ScriptedHandler {
    behavior: Behavior,
    config_path: String,
    log: HandlerLog,
}

#[async_trait]
impl OperationHandler for ScriptedHandler {
    async fn execute(
        &mut self,
        operation: &mut Operation,
        ctx: &ExecutionContext,
    ) -> Result<(), HandlerError> {
        self.log.invocations.lock().unwrap().push(Invocation {
            operation_type: operation.operation_type.clone(),
            order: operation.order,
            credential: ctx.identity.credential.path.clone(),
            shifters: ctx.shifters().to_vec(),
            config_path: self.config_path.clone(),
        });

        match &self.behavior {
            Behavior::Complete => {
                for file in &mut operation.files {
                    file.status = FileStatus::Done;
                }
                operation.status = OperationStatus::Done;
                Ok(())
            }
            Behavior::Leave(status) => {
                operation.status = *status;
                Ok(())
            }
            Behavior::Error(message) => Err(HandlerError::failed(message.clone())),
            Behavior::MarkFailed => {
                operation.status = OperationStatus::Failed;
                Ok(())
            }
            Behavior::FailAfterFirstFile => {
                if let Some(file) = operation.files.first_mut() {
                    file.status = FileStatus::Done;
                }
                operation.status = OperationStatus::Failed;
                Ok(())
            }
            Behavior::Panic(message) => panic!("{}", message),
        }
    }
}

/// Plugin path used for scripted handlers of `operation_type`.
pub fn plugin_path(operation_type: &str) -> String {
    format!("Tests/Handlers/{operation_type}")
}

/// Register a scripted handler with `behavior` under `path`, without routing
/// any operation type to it.
pub fn register_scripted(
    catalog: HandlerCatalog,
    path: &str,
    behavior: Behavior,
    log: &HandlerLog,
) -> HandlerCatalog {
    let log = log.clone();
    catalog.register(path, move |config_path| {
        log.constructed.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedHandler {
            behavior: behavior.clone(),
            config_path: config_path.to_string(),
            log: log.clone(),
        }) as Box<dyn OperationHandler>)
    })
}

/// Route `operation_type` to a scripted handler with `behavior`.
pub fn with_scripted(
    catalog: HandlerCatalog,
    operation_type: &str,
    behavior: Behavior,
    log: &HandlerLog,
) -> HandlerCatalog {
    let path = plugin_path(operation_type);
    register_scripted(catalog.route(operation_type, path.clone()), &path, behavior, log)
}

/// Route `operation_type` to a plugin whose constructor refuses its
/// configuration with `reason`.
pub fn with_refusing(catalog: HandlerCatalog, operation_type: &str, reason: &str) -> HandlerCatalog {
    let path = plugin_path(operation_type);
    let reason = reason.to_string();
    catalog
        .route(operation_type, path.clone())
        .register(&path, move |_config_path| Err(reason.clone()))
}

/// Test context wiring scripted collaborators into an executor.
pub struct TestContext {
    pub executor: RequestExecutor,
    pub store: Arc<InMemoryRequestStore>,
    pub issuer: Arc<FakeIssuer>,
    pub tracker: Arc<ScriptedTracker>,
    pub sleeper: Arc<RecordingSleeper>,
    pub metrics: Arc<InMemoryMetrics>,
    pub log: HandlerLog,
}

/// Builder for [`TestContext`].
pub struct TestContextBuilder {
    handlers: Vec<(String, Behavior)>,
    refusing: Vec<(String, String)>,
    plugins: Vec<(String, Behavior)>,
    job_alive: bool,
    liveness_error: bool,
    release_failures: u32,
    owner_registered: bool,
    shifters: Vec<ShifterSpec>,
    shifter_identities: Vec<(String, String)>,
    directory: StaticDirectory,
    store: Option<Arc<dyn RequestStore>>,
    config: Option<Config>,
}

impl TestContextBuilder {
    pub fn handler(mut self, operation_type: &str, behavior: Behavior) -> Self {
        self.handlers.push((operation_type.to_string(), behavior));
        self
    }

    /// Route `operation_type` to a plugin that refuses to be constructed.
    pub fn refusing_handler(mut self, operation_type: &str, reason: &str) -> Self {
        self.refusing
            .push((operation_type.to_string(), reason.to_string()));
        self
    }

    /// Register a scripted plugin under `path` without routing to it.
    pub fn plugin(mut self, path: &str, behavior: Behavior) -> Self {
        self.plugins.push((path.to_string(), behavior));
        self
    }

    pub fn job_alive(mut self, alive: bool) -> Self {
        self.job_alive = alive;
        self
    }

    pub fn release_failures(mut self, failures: u32) -> Self {
        self.release_failures = failures;
        self
    }

    pub fn liveness_unreachable(mut self) -> Self {
        self.liveness_error = true;
        self
    }

    pub fn owner_unregistered(mut self) -> Self {
        self.owner_registered = false;
        self
    }

    pub fn shifter(mut self, role: &str, user: &str, subject: &str, group: &str) -> Self {
        self.shifters.push(ShifterSpec::new(role, user, group));
        self.known_user(user, subject, group)
    }

    /// Make `user` resolvable and give `subject`@`group` a credential.
    pub fn known_user(mut self, user: &str, subject: &str, group: &str) -> Self {
        self.shifter_identities
            .push((subject.to_string(), group.to_string()));
        self.directory = self.directory.with_user(user, subject);
        self
    }

    /// Build the resolver and executor from `config` instead of the
    /// builder's shifters and defaults.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn store(mut self, store: Arc<dyn RequestStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> TestContext {
        let log = HandlerLog::default();
        let issuer = Arc::new(FakeIssuer::default());
        if self.owner_registered {
            issuer.register(OWNER_SUBJECT, OWNER_GROUP);
        }
        for (subject, group) in &self.shifter_identities {
            issuer.register(subject, group);
        }

        let mut catalog = HandlerCatalog::new();
        for (operation_type, behavior) in self.handlers {
            catalog = with_scripted(catalog, &operation_type, behavior, &log);
        }
        for (operation_type, reason) in &self.refusing {
            catalog = with_refusing(catalog, operation_type, reason);
        }
        for (path, behavior) in self.plugins {
            catalog = register_scripted(catalog, &path, behavior, &log);
        }

        let memory_store = Arc::new(InMemoryRequestStore::new());
        let store: Arc<dyn RequestStore> = self
            .store
            .unwrap_or_else(|| memory_store.clone() as Arc<dyn RequestStore>);
        let mut tracker = ScriptedTracker::new(self.job_alive, self.release_failures);
        if self.liveness_error {
            tracker = tracker.with_liveness_error();
        }
        let tracker = Arc::new(tracker);
        let sleeper = Arc::new(RecordingSleeper::default());
        let metrics = Arc::new(InMemoryMetrics::new());
        let directory = Arc::new(self.directory);
        let resolver = match &self.config {
            Some(config) => CredentialResolver::from_config(directory, issuer.clone(), config),
            None => CredentialResolver::new(directory, issuer.clone(), self.shifters),
        };

        let mut builder = RequestExecutor::builder()
            .store(store)
            .resolver(Arc::new(resolver))
            .catalog(Arc::new(catalog))
            .job_tracker(tracker.clone())
            .sleeper(sleeper.clone())
            .metrics(metrics.clone())
            .finalize_policy(RetryPolicy::default());
        if let Some(config) = &self.config {
            builder = builder.from_config(config);
        }
        let executor = builder.build().expect("Failed to build executor");

        TestContext {
            executor,
            store: memory_store,
            issuer,
            tracker,
            sleeper,
            metrics,
            log,
        }
    }
}

impl TestContext {
    pub fn builder() -> TestContextBuilder {
        TestContextBuilder {
            handlers: Vec::new(),
            refusing: Vec::new(),
            plugins: Vec::new(),
            job_alive: true,
            liveness_error: false,
            release_failures: 0,
            owner_registered: true,
            shifters: Vec::new(),
            shifter_identities: Vec::new(),
            directory: StaticDirectory::new(),
            store: None,
            config: None,
        }
    }

    /// Orders of the operations handed to handlers, in call order.
    pub fn invoked_orders(&self) -> Vec<u32> {
        self.log
            .invocations
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.order)
            .collect()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.log.invocations.lock().unwrap().clone()
    }

    /// Handler instances constructed across all scripted plugins.
    pub fn constructions(&self) -> usize {
        self.log.constructed.load(Ordering::SeqCst)
    }
}
