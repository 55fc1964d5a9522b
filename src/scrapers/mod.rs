//! Scrapers compiled into the binary

pub mod ao3;

pub use ao3::Ao3Scraper;

use crate::config::Config;
use crate::pipeline::Scraper;
use crate::Result;
use std::sync::Arc;

/// Every scraper enabled in `config`
pub fn build_scrapers(config: &Config) -> Result<Vec<Arc<dyn Scraper>>> {
    let mut scrapers: Vec<Arc<dyn Scraper>> = Vec::new();
    if config.ao3.enabled {
        scrapers.push(Arc::new(Ao3Scraper::new(config)?));
    }
    Ok(scrapers)
}
