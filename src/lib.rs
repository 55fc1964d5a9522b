//! Ourgraph: a "user likes document" graph harvester
//!
//! This crate continuously scrapes bipartite like relationships from external
//! sites, resolves each entity against a shared graph store, repairs
//! duplicate nodes and upserts the result.

pub mod config;
pub mod fetch;
pub mod pipeline;
pub mod ratelimit;
pub mod schema;
pub mod scrapers;
pub mod store;
pub mod transport;
pub mod upload;

use thiserror::Error;

/// Main error type for Ourgraph operations
#[derive(Debug, Error)]
pub enum OurgraphError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] fetch::FetchError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("Scraper {domain} failed: {message}")]
    Scrape { domain: String, message: String },

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),

    #[error("Invalid address in config: {0}")]
    InvalidAddress(String),
}

/// Returned by every wait that observes the shared cancellation token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Result type alias for Ourgraph operations
pub type Result<T> = std::result::Result<T, OurgraphError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use pipeline::{Consumer, Orchestrator, Scraper};
pub use schema::{make_slug, Document, Link, User};
pub use upload::Uploader;
