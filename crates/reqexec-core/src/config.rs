// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::credentials::{CredentialPolicy, DEFAULT_CACHE_HINT, DEFAULT_MIN_VALIDITY, ShifterSpec};
use crate::finalize::{DEFAULT_FINALIZE_ATTEMPTS, DEFAULT_FINALIZE_BACKOFF, RetryPolicy};

/// Default base configuration path handed to handlers.
pub const DEFAULT_CONFIG_PATH: &str = "/Systems/RequestManagement/Agents/RequestExecutingAgent";

/// Request executor configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL of the request store
    pub database_url: String,
    /// Base configuration path; handlers get `<base>/OperationHandlers/<Type>`
    pub config_path: String,
    /// Operation type -> handler plugin path
    pub operation_handlers: BTreeMap<String, String>,
    /// Pre-provisioned service identities
    pub shifters: Vec<ShifterSpec>,
    /// Validity constraints for issued credentials
    pub credential_policy: CredentialPolicy,
    /// Finalization retry policy
    pub finalize_policy: RetryPolicy,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `REQEXEC_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `REQEXEC_CONFIG_PATH`: base configuration path (default: `/Systems/RequestManagement/Agents/RequestExecutingAgent`)
    /// - `REQEXEC_OPERATION_HANDLERS`: `Type=plugin/path,...` (default: none)
    /// - `REQEXEC_SHIFTERS`: `Role=user:group,...` (default: none)
    /// - `REQEXEC_CREDENTIAL_MIN_VALIDITY_SECS`: default 1200
    /// - `REQEXEC_CREDENTIAL_CACHE_SECS`: default 172800
    /// - `REQEXEC_FINALIZE_MAX_ATTEMPTS`: default 10, must be at least 1
    /// - `REQEXEC_FINALIZE_BACKOFF_SECS`: default 10
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("REQEXEC_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("REQEXEC_DATABASE_URL"))?;

        let config_path = std::env::var("REQEXEC_CONFIG_PATH")
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let operation_handlers = match std::env::var("REQEXEC_OPERATION_HANDLERS") {
            Ok(raw) => parse_handler_table(&raw).ok_or(ConfigError::Invalid(
                "REQEXEC_OPERATION_HANDLERS",
                "must be a comma-separated list of Type=plugin/path",
            ))?,
            Err(_) => BTreeMap::new(),
        };

        let shifters = match std::env::var("REQEXEC_SHIFTERS") {
            Ok(raw) => parse_shifters(&raw).ok_or(ConfigError::Invalid(
                "REQEXEC_SHIFTERS",
                "must be a comma-separated list of Role=user:group",
            ))?,
            Err(_) => Vec::new(),
        };

        let min_validity = secs_var(
            "REQEXEC_CREDENTIAL_MIN_VALIDITY_SECS",
            DEFAULT_MIN_VALIDITY,
        )?;
        let cache_hint = secs_var("REQEXEC_CREDENTIAL_CACHE_SECS", DEFAULT_CACHE_HINT)?;

        let max_attempts: u32 = std::env::var("REQEXEC_FINALIZE_MAX_ATTEMPTS")
            .unwrap_or_else(|_| DEFAULT_FINALIZE_ATTEMPTS.to_string())
            .parse()
            .ok()
            .filter(|n| *n >= 1)
            .ok_or(ConfigError::Invalid(
                "REQEXEC_FINALIZE_MAX_ATTEMPTS",
                "must be a positive integer",
            ))?;
        let backoff = secs_var("REQEXEC_FINALIZE_BACKOFF_SECS", DEFAULT_FINALIZE_BACKOFF)?;

        Ok(Self {
            database_url,
            config_path,
            operation_handlers,
            shifters,
            credential_policy: CredentialPolicy {
                min_validity,
                cache_hint,
            },
            finalize_policy: RetryPolicy {
                max_attempts,
                backoff,
            },
        })
    }
}

fn secs_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::Invalid(name, "must be a whole number of seconds")),
        Err(_) => Ok(default),
    }
}

/// Parse `Type=plugin/path,Type2=plugin.path`. Empty input yields an empty table.
pub fn parse_handler_table(raw: &str) -> Option<BTreeMap<String, String>> {
    let mut table = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (op_type, path) = entry.split_once('=')?;
        let (op_type, path) = (op_type.trim(), path.trim());
        if op_type.is_empty() || path.is_empty() {
            return None;
        }
        table.insert(op_type.to_string(), path.to_string());
    }
    Some(table)
}

/// Parse `Role=user:group,...`. Empty input yields no shifters.
pub fn parse_shifters(raw: &str) -> Option<Vec<ShifterSpec>> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(ShifterSpec::parse)
        .collect()
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
