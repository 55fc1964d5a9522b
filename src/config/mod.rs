//! Configuration module for Ourgraph
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use ourgraph::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("ourgraph.toml")).unwrap();
//! println!("Uploaders: {}", config.pipeline.uploaders);
//! ```

mod parser;
mod types;
mod validation;

// Re-export types
pub use types::{
    Ao3Config, Config, FetchConfig, PipelineConfig, ProxyConfig, RetryConfig, StoreConfig,
};

// Re-export parser functions
pub use parser::{compute_config_hash, load_config, load_config_with_hash};
pub use validation::validate;
