//! In-memory request store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{RequestStore, StoreError};
use crate::request::Request;

/// Request store kept in process memory.
///
/// Ids are assigned sequentially starting at 1.
#[derive(Debug)]
pub struct InMemoryRequestStore {
    requests: RwLock<HashMap<i64, Request>>,
    next_id: AtomicI64,
    saves: AtomicUsize,
}

impl Default for InMemoryRequestStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRequestStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            requests: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful saves so far.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of stored requests.
    pub async fn len(&self) -> usize {
        self.requests.read().await.len()
    }

    /// Whether the store is empty.
    pub async fn is_empty(&self) -> bool {
        self.requests.read().await.is_empty()
    }
}

#[async_trait]
impl RequestStore for InMemoryRequestStore {
    async fn load(&self, request_id: i64) -> Result<Request, StoreError> {
        self.requests
            .read()
            .await
            .get(&request_id)
            .cloned()
            .ok_or(StoreError::NotFound { request_id })
    }

    async fn save(&self, request: &Request) -> Result<i64, StoreError> {
        let request_id = match request.request_id {
            Some(id) => id,
            None => self.next_id.fetch_add(1, Ordering::SeqCst),
        };

        let mut stored = request.clone();
        stored.request_id = Some(request_id);
        stored.last_update = Some(Utc::now());

        self.requests.write().await.insert(request_id, stored);
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(request_id)
    }
}
