// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operation handlers and their registry.
//!
//! Operation types are routed to plugin paths by configuration, and plugin
//! paths to constructor functions registered at process start. A
//! [`HandlerRegistry`] lives for one request-processing session and caches
//! both loaded handlers and load failures per operation type.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error};

use crate::credentials::{CREDENTIAL_ENV_VAR, ResolvedIdentity};
use crate::error::ErrorKind;
use crate::metrics::MetricsSink;
use crate::request::{Operation, Request};

/// Handler resolution and execution errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum HandlerError {
    /// No plugin path is configured for the operation type.
    #[error("handler for operation '{operation_type}' not set")]
    NotConfigured {
        /// The operation type.
        operation_type: String,
    },

    /// The configured plugin path has no registered constructor.
    #[error("no handler plugin registered at '{plugin_path}' for operation '{operation_type}'")]
    PluginNotFound {
        /// The operation type.
        operation_type: String,
        /// Normalized plugin path.
        plugin_path: String,
    },

    /// The plugin refused to be constructed for its configuration path.
    #[error("operation handler '{plugin}' rejected configuration '{config_path}': {reason}")]
    ContractViolation {
        /// Plugin name.
        plugin: String,
        /// Configuration path given to the constructor.
        config_path: String,
        /// Constructor message.
        reason: String,
    },

    /// The handler reported a failure while executing.
    #[error("{0}")]
    ExecutionFailed(String),
}

impl HandlerError {
    /// Shorthand for an execution failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed(message.into())
    }

    /// Get the error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConfigured { .. } | Self::PluginNotFound { .. } => ErrorKind::PluginNotFound,
            Self::ContractViolation { .. } => ErrorKind::ContractViolation,
            Self::ExecutionFailed(_) => ErrorKind::ExecutionFailed,
        }
    }
}

/// Per-request data handed to handlers alongside the operation.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Request id, if stored.
    pub request_id: Option<i64>,
    /// Request name.
    pub request_name: String,
    /// Owner subject.
    pub owner_subject: String,
    /// Owner group.
    pub owner_group: String,
    /// Originating job.
    pub job_id: Option<i64>,
    /// Identity to act under.
    pub identity: ResolvedIdentity,
}

impl ExecutionContext {
    /// Build a context for `request` running under `identity`.
    pub fn new(request: &Request, identity: ResolvedIdentity) -> Self {
        Self {
            request_id: request.request_id,
            request_name: request.request_name.clone(),
            owner_subject: request.owner_subject.clone(),
            owner_group: request.owner_group.clone(),
            job_id: request.job_id,
            identity,
        }
    }

    /// Shifter roles the owner maps to, if any.
    pub fn shifters(&self) -> &[String] {
        &self.identity.shifters
    }

    /// Environment to pass to external tools spawned by a handler.
    pub fn credential_env(&self) -> Vec<(&'static str, PathBuf)> {
        vec![(CREDENTIAL_ENV_VAR, self.identity.credential.path.clone())]
    }
}

/// Logic for one operation type.
///
/// A handler instance is reused for every operation of its type within a
/// session. `execute` reports progress by mutating the operation and its
/// files; returning `Err` signals that the invocation itself failed.
#[async_trait]
pub trait OperationHandler: Send {
    /// Process `operation` under the identity in `ctx`.
    async fn execute(
        &mut self,
        operation: &mut Operation,
        ctx: &ExecutionContext,
    ) -> Result<(), HandlerError>;
}

/// Constructor for a handler, given its configuration path.
pub type HandlerFactory =
    Arc<dyn Fn(&str) -> Result<Box<dyn OperationHandler>, String> + Send + Sync>;

/// Normalize a plugin path to dotted form.
///
/// `DIRAC/DataManagementSystem//Agent/Foo` becomes
/// `DIRAC.DataManagementSystem.Agent.Foo`.
pub fn normalize_plugin_path(path: &str) -> String {
    if path.contains('/') {
        path.split('/')
            .filter(|chunk| !chunk.is_empty())
            .collect::<Vec<_>>()
            .join(".")
    } else {
        path.to_string()
    }
}

/// Plugin name: the last segment of the normalized path.
pub fn plugin_name(path: &str) -> String {
    let normalized = normalize_plugin_path(path);
    normalized
        .rsplit('.')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Routing table plus constructor map.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    routes: HashMap<String, String>,
    factories: HashMap<String, HandlerFactory>,
}

impl std::fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut plugins: Vec<&String> = self.factories.keys().collect();
        plugins.sort();
        f.debug_struct("HandlerCatalog")
            .field("routes", &self.routes)
            .field("plugins", &plugins)
            .finish()
    }
}

impl HandlerCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route an operation type to a plugin path.
    pub fn route(mut self, operation_type: impl Into<String>, plugin_path: impl Into<String>) -> Self {
        self.routes.insert(operation_type.into(), plugin_path.into());
        self
    }

    /// Add every route from a type -> plugin path table.
    pub fn with_routes<I, K, V>(mut self, routes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.routes
            .extend(routes.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Register the constructor for a plugin path (dotted or slash form).
    pub fn register<F>(mut self, plugin_path: &str, factory: F) -> Self
    where
        F: Fn(&str) -> Result<Box<dyn OperationHandler>, String> + Send + Sync + 'static,
    {
        self.factories
            .insert(normalize_plugin_path(plugin_path), Arc::new(factory));
        self
    }

    /// Configured plugin path for an operation type.
    pub fn plugin_path(&self, operation_type: &str) -> Option<&str> {
        self.routes.get(operation_type).map(String::as_str)
    }

    /// Plugin name serving an operation type, if routed.
    pub fn plugin_for(&self, operation_type: &str) -> Option<String> {
        self.plugin_path(operation_type).map(plugin_name)
    }
}

/// Counter names for one plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerCounters {
    /// Invocations started.
    pub attempted: String,
    /// Invocations leaving the operation Done.
    pub succeeded: String,
    /// Invocations that failed.
    pub failed: String,
}

impl HandlerCounters {
    /// Counter names for `plugin`.
    pub fn for_plugin(plugin: &str) -> Self {
        Self {
            attempted: format!("{plugin}.attempted"),
            succeeded: format!("{plugin}.succeeded"),
            failed: format!("{plugin}.failed"),
        }
    }

    fn register(&self, plugin: &str, metrics: &dyn MetricsSink) {
        metrics.register_counter(&self.attempted, &format!("{plugin} operations attempted"));
        metrics.register_counter(&self.succeeded, &format!("{plugin} operations successful"));
        metrics.register_counter(&self.failed, &format!("{plugin} operations failed"));
    }
}

/// A constructed handler with its counters.
pub struct LoadedHandler {
    /// Plugin name.
    pub plugin: String,
    /// Counter names for this plugin.
    pub counters: HandlerCounters,
    handler: Box<dyn OperationHandler>,
}

impl std::fmt::Debug for LoadedHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedHandler")
            .field("plugin", &self.plugin)
            .field("counters", &self.counters)
            .finish()
    }
}

impl LoadedHandler {
    /// Run the handler on `operation`.
    pub async fn execute(
        &mut self,
        operation: &mut Operation,
        ctx: &ExecutionContext,
    ) -> Result<(), HandlerError> {
        self.handler.execute(operation, ctx).await
    }
}

/// Session-scoped handler cache.
pub struct HandlerRegistry<'a> {
    catalog: &'a HandlerCatalog,
    config_path: &'a str,
    metrics: &'a dyn MetricsSink,
    cache: HashMap<String, Result<LoadedHandler, HandlerError>>,
}

impl<'a> HandlerRegistry<'a> {
    /// Create an empty session cache over `catalog`.
    pub fn new(
        catalog: &'a HandlerCatalog,
        config_path: &'a str,
        metrics: &'a dyn MetricsSink,
    ) -> Self {
        Self {
            catalog,
            config_path,
            metrics,
            cache: HashMap::new(),
        }
    }

    /// Handler for an operation type, constructing it on first use.
    ///
    /// A failed load is remembered and returned again for the rest of the
    /// session.
    pub fn get_handler(&mut self, operation_type: &str) -> Result<&mut LoadedHandler, HandlerError> {
        let slot = match self.cache.entry(operation_type.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let loaded = load_handler(self.catalog, self.config_path, self.metrics, operation_type);
                if let Err(e) = &loaded {
                    error!(operation_type, error = %e, "Unable to load operation handler");
                }
                entry.insert(loaded)
            }
        };
        slot.as_mut().map_err(|e| e.clone())
    }

    /// Number of operation types resolved so far (successfully or not).
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Whether nothing was resolved yet.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

fn load_handler(
    catalog: &HandlerCatalog,
    config_path: &str,
    metrics: &dyn MetricsSink,
    operation_type: &str,
) -> Result<LoadedHandler, HandlerError> {
    let plugin_path = catalog
        .plugin_path(operation_type)
        .ok_or_else(|| HandlerError::NotConfigured {
            operation_type: operation_type.to_string(),
        })?;
    let normalized = normalize_plugin_path(plugin_path);

    let factory = catalog
        .factories
        .get(&normalized)
        .ok_or_else(|| HandlerError::PluginNotFound {
            operation_type: operation_type.to_string(),
            plugin_path: normalized.clone(),
        })?;

    let plugin = plugin_name(&normalized);
    let handler_config = format!("{}/OperationHandlers/{}", config_path, operation_type);
    let handler = factory(&handler_config).map_err(|reason| HandlerError::ContractViolation {
        plugin: plugin.clone(),
        config_path: handler_config.clone(),
        reason,
    })?;

    let counters = HandlerCounters::for_plugin(&plugin);
    counters.register(&plugin, metrics);
    debug!(operation_type, plugin = %plugin, config_path = %handler_config, "Operation handler loaded");

    Ok(LoadedHandler {
        plugin,
        counters,
        handler,
    })
}
