//! Page fetching: HTTP client construction and the worker pool

pub mod client;
pub mod page;
pub mod pool;

pub use client::build_http_client;
pub use page::Page;
pub use pool::{FetchPool, FetchPoolBuilder};

use crate::Cancelled;
use thiserror::Error;

/// Errors from scheduling or performing a fetch
///
/// Per-URL failures are logged by the worker and the URL is dropped; only
/// `Cancelled`, `PoolClosed` and `Client` ever reach a caller.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    #[error("Request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },

    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Rate limited by {url}, requeued")]
    TooManyRequests { url: String },

    #[error("Failed to read body of {url}: {source}")]
    Body { url: String, source: reqwest::Error },

    #[error("Fetch pool is closed")]
    PoolClosed,

    #[error("Fetch output queue is closed")]
    OutputClosed,

    #[error(transparent)]
    Cancelled(#[from] Cancelled),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
