//! Per-domain upload counters
//!
//! Every successful upsert is counted against the host of the entity's
//! source URL. The orchestrator logs a snapshot periodically and once more
//! on shutdown.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use url::Url;

/// Count of uploaded entities per source host
#[derive(Debug)]
pub struct DomainStats {
    counts: Mutex<BTreeMap<String, u64>>,
    since: DateTime<Utc>,
}

impl Default for DomainStats {
    fn default() -> Self {
        Self::new()
    }
}

impl DomainStats {
    pub fn new() -> Self {
        Self {
            counts: Mutex::new(BTreeMap::new()),
            since: Utc::now(),
        }
    }

    /// Counts one upload against the host of `url`
    ///
    /// URLs that do not parse are logged at debug level and not counted.
    ///
    /// # Arguments
    ///
    /// * `url` - A document URL or one of a user's profile URLs
    pub fn record(&self, url: &str) {
        let host = match Url::parse(url) {
            Ok(parsed) => parsed.host_str().unwrap_or_default().to_string(),
            Err(e) => {
                tracing::debug!("not counting unparseable url {}: {}", url, e);
                return;
            }
        };
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host)
            .or_insert(0) += 1;
    }

    /// Copy of the current counts, keyed by host
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn total(&self) -> u64 {
        self.snapshot().values().sum()
    }

    /// When counting started
    pub fn since(&self) -> DateTime<Utc> {
        self.since
    }

    /// Logs the current counts at info level
    pub fn log(&self) {
        let snapshot = self.snapshot();
        let total: u64 = snapshot.values().sum();
        tracing::info!(
            "Stats since {}: {} uploaded {:?}",
            self.since.format("%Y-%m-%d %H:%M:%S"),
            total,
            snapshot
        );
    }
}
