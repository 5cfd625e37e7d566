//! Persistence interfaces and backends for reqexec-core.
//!
//! The engine only loads a request at the start of a session and saves it
//! once it is Done; everything else about request storage belongs to the
//! producers and schedulers around the engine.

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryRequestStore;
pub use self::sqlite::SqliteRequestStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::request::Request;

/// Request store errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No request with this id exists.
    #[error("request {request_id} not found")]
    NotFound {
        /// The id that was looked up.
        request_id: i64,
    },

    /// Database operation failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Request body could not be (de)serialized.
    #[error("request serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

/// Storage for requests.
#[async_trait]
pub trait RequestStore: Send + Sync {
    /// Load a request by id.
    async fn load(&self, request_id: i64) -> Result<Request, StoreError>;

    /// Insert (no id yet) or update a request; returns its id.
    async fn save(&self, request: &Request) -> Result<i64, StoreError>;
}
