//! Scraper-to-uploader pipeline

pub mod consumer;
pub mod orchestrator;

pub use consumer::{entity_queues, Consumer, Entity, EntityReceivers, DEFAULT_QUEUE_CAPACITY};
pub use orchestrator::Orchestrator;

use crate::schema::{Document, Link};
use crate::OurgraphError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// A site-specific source of users and documents
#[async_trait]
pub trait Scraper: Send + Sync {
    /// Domain this scraper covers, e.g. `archiveofourown.org`
    fn domain(&self) -> &str;

    /// Emits entities into `consumer` until cancelled or out of work
    ///
    /// Returning an error other than cancellation stops the whole pipeline.
    async fn scrape(
        &self,
        cancel: &CancellationToken,
        consumer: Consumer,
    ) -> Result<(), OurgraphError>;

    /// Maps any page URL of a document to its identity key
    fn normalize(&self, url: &Url) -> Result<String, OurgraphError>;

    /// External links for a document
    fn links(&self, doc: &Document) -> Vec<Link>;
}

/// Keeps the scrapers whose domain contains `filter`; an empty filter keeps all
pub fn filter_scrapers(scrapers: Vec<Arc<dyn Scraper>>, filter: &str) -> Vec<Arc<dyn Scraper>> {
    scrapers
        .into_iter()
        .filter(|scraper| scraper.domain().contains(filter))
        .collect()
}
