//! Pipeline orchestration
//!
//! Wires scraper tasks to a fixed pool of uploader tasks through the entity
//! queues, supervises them in one `JoinSet`, and turns the first task
//! failure into a pipeline-wide cancellation.

use crate::config::Config;
use crate::pipeline::{entity_queues, Scraper};
use crate::store::{GraphStore, RetryPolicy};
use crate::upload::{DomainStats, IdentityCache, Uploader};
use crate::{OurgraphError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs scrapers and uploaders against one store until the work runs out,
/// a task fails, or the shared token is cancelled
pub struct Orchestrator {
    store: Arc<dyn GraphStore>,
    cache: Arc<IdentityCache>,
    stats: Arc<DomainStats>,
    retry: RetryPolicy,
    uploaders: usize,
    queue_capacity: usize,
    stats_interval: Option<Duration>,
}

impl Orchestrator {
    /// Creates an orchestrator with a fresh identity cache and stats
    ///
    /// # Arguments
    ///
    /// * `store` - The graph store every uploader writes to
    /// * `config` - Uploader count, queue capacity, stats interval and retry policy
    pub fn new(store: Arc<dyn GraphStore>, config: &Config) -> Self {
        Self {
            store,
            cache: Arc::new(IdentityCache::new()),
            stats: Arc::new(DomainStats::new()),
            retry: RetryPolicy::from(&config.retry),
            uploaders: config.pipeline.uploaders.max(1),
            queue_capacity: config.pipeline.queue_capacity,
            stats_interval: config.pipeline.stats_interval(),
        }
    }

    /// Default settings without the periodic report
    pub fn with_store(store: Arc<dyn GraphStore>) -> Self {
        Self::new(store, &Config::default()).stats_interval(None)
    }

    /// Number of concurrent uploader tasks, at least one
    pub fn uploaders(mut self, uploaders: usize) -> Self {
        self.uploaders = uploaders.max(1);
        self
    }

    /// Period of the stats reporter; `None` disables it
    pub fn stats_interval(mut self, interval: Option<Duration>) -> Self {
        self.stats_interval = interval;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn stats(&self) -> &DomainStats {
        &self.stats
    }

    pub fn cache(&self) -> &IdentityCache {
        &self.cache
    }

    /// Runs the pipeline
    ///
    /// Returns once every scraper has finished and the entity queues are
    /// drained, or after cancellation once every task has unwound. The first
    /// task error cancels `cancel` and is returned.
    ///
    /// # Arguments
    ///
    /// * `scrapers` - Scrapers to launch, one task each
    /// * `cancel` - Shared cancellation token for every task
    ///
    /// # Errors
    ///
    /// * `OurgraphError::Store` - the store failed its health check
    /// * `OurgraphError::TaskPanicked` - a scraper or uploader task panicked
    /// * any error a scraper returned other than cancellation
    pub async fn run(
        &self,
        scrapers: Vec<Arc<dyn Scraper>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.retry
            .run(cancel, "store health check", || self.store.health())
            .await?;

        if scrapers.is_empty() {
            tracing::warn!("no scrapers to run");
        }

        let (consumer, receivers) = entity_queues(self.queue_capacity);
        let receivers = Arc::new(receivers);
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();

        for scraper in scrapers {
            let cancel = cancel.clone();
            let consumer = consumer.clone();
            tracing::info!("launching scraper for {:?}", scraper.domain());
            tasks.spawn(async move {
                let domain = scraper.domain().to_string();
                let result = scraper.scrape(&cancel, consumer).await;
                tracing::info!("scraper done {:?}", domain);
                match result {
                    Err(OurgraphError::Cancelled(_)) if cancel.is_cancelled() => Ok(()),
                    Err(e) => {
                        tracing::error!("scraper error {:?}: {}", domain, e);
                        Err(e)
                    }
                    Ok(()) => Ok(()),
                }
            });
        }
        // queues close once the last scraper drops its clone
        drop(consumer);

        let uploader = Uploader::new(
            self.store.clone(),
            self.cache.clone(),
            self.stats.clone(),
            self.retry.clone(),
        );
        for _ in 0..self.uploaders {
            let uploader = uploader.clone();
            let receivers = receivers.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                uploader.run(&cancel, &receivers).await;
                Ok(())
            });
        }
        tracing::debug!("started {} uploaders", self.uploaders);

        let reporter_stop = cancel.child_token();
        let reporter = self.stats_interval.map(|interval| {
            tokio::spawn(report(self.stats.clone(), interval, reporter_stop.clone()))
        });

        let mut first_err: Option<OurgraphError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Err(e) => {
                    tracing::error!("pipeline task panicked: {}", e);
                    cancel.cancel();
                    first_err.get_or_insert_with(|| OurgraphError::TaskPanicked(e.to_string()));
                }
                Ok(Err(e)) => {
                    cancel.cancel();
                    first_err.get_or_insert(e);
                }
                Ok(Ok(())) => {}
            }
        }

        reporter_stop.cancel();
        if let Some(reporter) = reporter {
            if let Err(e) = reporter.await {
                tracing::error!("stats reporter panicked: {}", e);
            }
        }
        self.stats.log();

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn report(stats: Arc<DomainStats>, interval: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticker.tick() => stats.log(),
        }
    }
}
