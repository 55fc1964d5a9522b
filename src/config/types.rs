use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Ourgraph
///
/// Every section is optional; an empty file yields a configuration that
/// scrapes all compiled-in sites into a local Dgraph instance.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub ao3: Ao3Config,
}

/// Orchestrator and uploader configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Number of concurrent uploader workers
    pub uploaders: usize,

    /// Capacity of each of the two entity queues
    #[serde(rename = "queue-capacity")]
    pub queue_capacity: usize,

    /// Seconds between per-domain statistics reports (0 disables the reporter)
    #[serde(rename = "stats-interval-secs")]
    pub stats_interval_secs: u64,

    /// Only scrapers whose domain contains this substring are launched
    #[serde(rename = "scrape-filter")]
    pub scrape_filter: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            uploaders: 16,
            queue_capacity: crate::pipeline::DEFAULT_QUEUE_CAPACITY,
            stats_interval_secs: 10,
            scrape_filter: String::new(),
        }
    }
}

impl PipelineConfig {
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

/// Graph store connection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base URL of the Dgraph HTTP endpoint
    pub address: String,

    /// Per-request timeout for store round-trips
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:8080".to_string(),
            timeout_secs: 60,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// HTTP fetch configuration shared by every transport
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// User-Agent header sent with every request
    #[serde(rename = "user-agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(rename = "timeout-secs")]
    pub timeout_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "ourgraph/1.0".to_string(),
            timeout_secs: 60,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// SOCKS5 proxy endpoint; its host name may resolve to many addresses
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// `host:port` of the proxy service
    pub address: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// Exponential backoff for transient store errors
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,

    #[serde(rename = "initial-backoff-ms")]
    pub initial_backoff_ms: u64,

    #[serde(rename = "max-backoff-ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
        }
    }
}

/// archiveofourown.org scraper settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Ao3Config {
    pub enabled: bool,

    /// Workers per fetch pool
    pub workers: usize,

    /// Rate limit applied to each transport in the proxy pool
    #[serde(rename = "requests-per-second")]
    pub requests_per_second: f64,
}

impl Default for Ao3Config {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: 100,
            requests_per_second: 0.2,
        }
    }
}
