// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tracing subscriber setup for processes embedding the engine.

use thiserror::Error;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::{Directive, ParseError};

/// Default filter directive for this crate.
pub const DEFAULT_DIRECTIVE: &str = "reqexec_core=info";

/// Subscriber installation failures.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The default directive could not be parsed.
    #[error("invalid tracing directive '{directive}': {reason}")]
    InvalidDirective {
        /// The rejected directive.
        directive: String,
        /// Parser message.
        reason: String,
    },

    /// A global subscriber is already installed.
    #[error("tracing subscriber already installed: {0}")]
    AlreadyInstalled(String),
}

/// Install a fmt subscriber filtered by `RUST_LOG`.
///
/// `default_directive` is used only when `RUST_LOG` is unset or holds no
/// valid directive; a non-empty `RUST_LOG` replaces it entirely.
pub fn init_tracing(default_directive: &str) -> Result<(), TelemetryError> {
    let env_directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();

    tracing_subscriber::fmt()
        .with_env_filter(build_filter(default_directive, &env_directives)?)
        .try_init()
        .map_err(|e| TelemetryError::AlreadyInstalled(e.to_string()))
}

fn build_filter(default_directive: &str, env_directives: &str) -> Result<EnvFilter, TelemetryError> {
    let directive: Directive = default_directive
        .parse()
        .map_err(|e: ParseError| TelemetryError::InvalidDirective {
            directive: default_directive.to_string(),
            reason: e.to_string(),
        })?;

    Ok(EnvFilter::builder()
        .with_default_directive(directive)
        .parse_lossy(env_directives))
}
