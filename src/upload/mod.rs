//! Dedup and upload pipeline
//!
//! Uploaders take entities off the shared consumer queues, resolve every
//! identity they contain against the [`IdentityCache`] and the store, and
//! write each entity with one immediately committed upsert.

pub mod cache;
pub mod stats;
pub mod uploader;

pub use cache::{CachedIdentity, IdentityCache};
pub use stats::DomainStats;
pub use uploader::{UploadOutcome, Uploader};

use crate::schema::{EntityKind, ValidationError};
use crate::store::StoreError;
use thiserror::Error;

/// Why a single entity was dropped
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid entity: {0}")]
    Validation(#[from] ValidationError),

    #[error("{operation} of {kind} {key} failed: {source}")]
    Store {
        operation: &'static str,
        kind: &'static str,
        key: String,
        source: StoreError,
    },

    #[error("store returned an empty uid for {kind} {key}")]
    InvalidUid { kind: &'static str, key: String },

    #[error("mutation for {kind} {key} returned no uid for label {label}")]
    MissingUid {
        kind: &'static str,
        key: String,
        label: String,
    },

    #[error("failed to encode {kind} {key}: {source}")]
    Encode {
        kind: &'static str,
        key: String,
        source: serde_json::Error,
    },
}

impl UploadError {
    pub(crate) fn store(
        operation: &'static str,
        kind: EntityKind,
        key: &str,
        source: StoreError,
    ) -> Self {
        Self::Store {
            operation,
            kind: kind.as_str(),
            key: key.to_string(),
            source,
        }
    }

    /// True when the attempt stopped because the pipeline is shutting down
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Store {
                source: StoreError::Cancelled(_),
                ..
            }
        )
    }
}
