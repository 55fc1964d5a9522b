//! Graph store protocol
//!
//! The uploader talks to the store only through [`GraphStore`]: best-effort
//! parametrized queries, immediately committed mutations, and a health check.
//! [`DgraphStore`] speaks the Dgraph HTTP API; [`MemoryStore`] is an
//! in-process stand-in used by tests and `--dry-run`.

pub mod dgraph;
pub mod memory;
pub mod retry;
pub mod schema;

pub use dgraph::DgraphStore;
pub use memory::MemoryStore;
pub use retry::RetryPolicy;
pub use schema::SCHEMA;

use crate::Cancelled;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

/// Query variables, keyed with their leading `$`
pub type Vars = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Store returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Store rejected request: {0}")]
    Remote(String),

    #[error("Failed to decode store response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl StoreError {
    /// Whether retrying the same request may succeed
    ///
    /// Connection failures, timeouts, connections dropped while the request
    /// or body was in flight, HTTP 5xx and 429 are transient. Remote query
    /// errors, decode failures and cancellation are not.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Http(e) => {
                e.is_connect() || e.is_timeout() || e.is_request() || e.is_body()
            }
            StoreError::Status { status, .. } => {
                *status >= 500 || *status == StatusCode::TOO_MANY_REQUESTS.as_u16()
            }
            _ => false,
        }
    }
}

/// A single transactional write, committed immediately
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Mutation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<Value>,
}

impl Mutation {
    pub fn set(payload: Value) -> Self {
        Self {
            set: Some(payload),
            delete: None,
        }
    }

    pub fn delete(payload: Value) -> Self {
        Self {
            set: None,
            delete: Some(payload),
        }
    }
}

/// Node ids assigned to the blank labels of a mutation
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Assigned {
    /// Label (without the `_:` prefix) to assigned uid
    #[serde(default)]
    pub uids: HashMap<String, String>,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Runs a read-only query; returns the `data` object keyed by result set
    async fn query(&self, query: &str, vars: &Vars) -> Result<Value, StoreError>;

    async fn mutate(&self, mutation: Mutation) -> Result<Assigned, StoreError>;

    async fn health(&self) -> Result<(), StoreError>;

    /// Installs or updates the predicate schema
    async fn alter(&self, schema: &str) -> Result<(), StoreError>;

    /// The schema currently installed
    async fn schema(&self) -> Result<Value, StoreError> {
        self.query("schema {}", &Vars::new()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_mutation_serialization_skips_empty_payloads() {
        let mutation = Mutation::set(json!({"uid": "_:doc", "url": "http://s/1"}));
        assert_eq!(
            serde_json::to_value(&mutation).unwrap(),
            json!({"set": {"uid": "_:doc", "url": "http://s/1"}})
        );

        let mutation = Mutation::delete(json!([{"uid": "0x2"}]));
        assert_eq!(
            serde_json::to_value(&mutation).unwrap(),
            json!({"delete": [{"uid": "0x2"}]})
        );
    }

    #[test]
    fn test_transient_classification() {
        let unavailable = StoreError::Status {
            status: 503,
            body: String::new(),
        };
        let throttled = StoreError::Status {
            status: 429,
            body: String::new(),
        };
        let bad_request = StoreError::Status {
            status: 400,
            body: String::new(),
        };
        assert!(unavailable.is_transient());
        assert!(throttled.is_transient());
        assert!(!bad_request.is_transient());
        assert!(!StoreError::Remote("syntax error".to_string()).is_transient());
        assert!(!StoreError::Cancelled(Cancelled).is_transient());
    }
}
