// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Named counters emitted by the engine.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

/// Sink for named counters.
///
/// Implementations forward counters to whatever monitoring system the host
/// process uses. Incrementing an unregistered counter is allowed and must not
/// fail.
pub trait MetricsSink: Send + Sync {
    /// Declare a counter. Registering the same name twice is a no-op.
    fn register_counter(&self, name: &str, description: &str);

    /// Add one to a counter.
    fn increment(&self, name: &str);

    /// Push accumulated values downstream.
    fn flush(&self);
}

#[derive(Debug, Clone, Default)]
struct Counter {
    description: String,
    total: u64,
    unflushed: u64,
}

/// In-process counter registry.
///
/// Keeps running totals and reports the increments accumulated since the
/// previous flush through `tracing`.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<String, Counter>>,
}

impl InMemoryMetrics {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Counter>> {
        self.counters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Total value of a counter (0 if it was never touched).
    pub fn value(&self, name: &str) -> u64 {
        self.lock().get(name).map(|c| c.total).unwrap_or(0)
    }

    /// Increments not yet flushed.
    pub fn pending(&self, name: &str) -> u64 {
        self.lock().get(name).map(|c| c.unflushed).unwrap_or(0)
    }

    /// Whether a counter was registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.lock()
            .get(name)
            .is_some_and(|c| !c.description.is_empty())
    }

    /// Description a counter was registered with.
    pub fn description(&self, name: &str) -> Option<String> {
        self.lock()
            .get(name)
            .filter(|c| !c.description.is_empty())
            .map(|c| c.description.clone())
    }
}

impl MetricsSink for InMemoryMetrics {
    fn register_counter(&self, name: &str, description: &str) {
        let mut counters = self.lock();
        let counter = counters.entry(name.to_string()).or_default();
        if counter.description.is_empty() {
            counter.description = description.to_string();
        }
    }

    fn increment(&self, name: &str) {
        let mut counters = self.lock();
        let counter = counters.entry(name.to_string()).or_default();
        counter.total += 1;
        counter.unflushed += 1;
    }

    fn flush(&self) {
        let mut counters = self.lock();
        for (name, counter) in counters.iter_mut().filter(|(_, c)| c.unflushed > 0) {
            debug!(
                counter = %name,
                delta = counter.unflushed,
                total = counter.total,
                "Counter flushed"
            );
            counter.unflushed = 0;
        }
    }
}
