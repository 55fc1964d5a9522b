//! archiveofourown.org
//!
//! Random works are sampled by id up to the newest one. Each work's
//! bookmarks page names users, and each user's bookmark pages list the works
//! they liked. Requests go out through the proxy-aware [`TransportPool`],
//! which paces every transport on its own.

use crate::config::{Ao3Config, Config, FetchConfig, ProxyConfig};
use crate::fetch::{build_http_client, FetchPool, Page};
use crate::pipeline::{Consumer, Scraper};
use crate::ratelimit::per_second_factory;
use crate::schema::{make_slug, parse_count, remove_empty, Document, Link, User};
use crate::transport::{ClientSource, TransportPool};
use crate::{Cancelled, OurgraphError, Result};
use async_trait::async_trait;
use rand::Rng;
use scraper::{ElementRef, Selector};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const DOMAIN: &str = "archiveofourown.org";

const BASE_URL: &str = "https://archiveofourown.org/";

/// Newest works first
const SEARCH_PATH: &str = concat!(
    "works/search?work_search%5Bquery%5D=",
    "&work_search%5Bsort_column%5D=created_at",
    "&work_search%5Bsort_direction%5D=desc",
    "&commit=Search"
);

const DELETED_MESSAGE: &str = "This has been deleted, sorry!";

pub struct Ao3Scraper {
    config: Ao3Config,
    fetch: FetchConfig,
    proxy: Option<ProxyConfig>,
    base: Url,
}

impl Ao3Scraper {
    /// Creates the scraper from the `[ao3]`, `[fetch]` and `[proxy]` sections
    ///
    /// No network access happens until [`Scraper::scrape`] runs.
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            config: config.ao3.clone(),
            fetch: config.fetch.clone(),
            proxy: config.proxy.clone(),
            base: Url::parse(BASE_URL)?,
        })
    }

    /// Points every request at another host; identity keys stay canonical
    pub fn with_base_url(mut self, base: Url) -> Self {
        self.base = base;
        self
    }

    fn error(&self, message: impl Into<String>) -> OurgraphError {
        OurgraphError::Scrape {
            domain: DOMAIN.to_string(),
            message: message.into(),
        }
    }

    /// Id of the newest work on the site
    async fn latest_work(&self, cancel: &CancellationToken) -> Result<u64> {
        let url = self.base.join(SEARCH_PATH)?;
        let client = build_http_client(&self.fetch, None)?;

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(Cancelled.into()),
            response = client.get(url.clone()).send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            return Err(self.error(format!("get {} status = {}", url, status)));
        }
        let body = response.text().await?;

        parse_latest(&Page::new(url, status.as_u16(), body))?
            .ok_or_else(|| self.error("failed to determine latest work"))
    }

    fn bookmarks_url(&self, work: u64) -> Result<Url> {
        Ok(self.base.join(&format!("works/{}/bookmarks", work))?)
    }

    /// Schedules random work bookmark pages until cancelled, then closes `docs`
    async fn generate_works(&self, cancel: &CancellationToken, docs: &FetchPool, latest: u64) {
        loop {
            let id = rand::rng().random_range(1..=latest);
            let url = match self.bookmarks_url(id) {
                Ok(url) => url,
                Err(e) => {
                    tracing::error!("cannot build bookmarks url for work {}: {}", id, e);
                    break;
                }
            };
            if docs.schedule(cancel, url.as_str()).await.is_err() {
                break;
            }
        }
        docs.close().await;
    }

    /// Turns work bookmark pages into user bookmark jobs, then closes `users`
    async fn follow_bookmarkers(
        &self,
        cancel: &CancellationToken,
        mut pages: mpsc::Receiver<Page>,
        users: &FetchPool,
    ) {
        'pages: while let Some(page) = pages.recv().await {
            let bookmarkers = match parse_doc_bookmarks(&page) {
                Ok(bookmarkers) => bookmarkers,
                Err(e) => {
                    tracing::warn!("error processing document (url={}): {}", page.url, e);
                    continue;
                }
            };
            for user in bookmarkers {
                let url = format!("{}/bookmarks", user);
                if users.schedule(cancel, url).await.is_err() {
                    break 'pages;
                }
            }
        }
        users.close().await;
    }

    /// Emits a user per bookmark page and queues the next page when it had likes
    async fn emit_users(
        &self,
        cancel: &CancellationToken,
        mut pages: mpsc::Receiver<Page>,
        users: &FetchPool,
        consumer: &Consumer,
    ) {
        while let Some(page) = pages.recv().await {
            let user = match parse_user_bookmarks(&page) {
                Ok(user) => user,
                Err(e) => {
                    tracing::warn!("error processing document (url={}): {}", page.url, e);
                    continue;
                }
            };

            let has_likes = !user.likes.is_empty();
            if consumer.send_user(cancel, user).await.is_err() {
                break;
            }
            if has_likes {
                match increment_page_url(&page.url) {
                    Ok(next) => {
                        if !users.schedule_priority(next.as_str()) {
                            tracing::debug!("dropped next page {}", next);
                        }
                    }
                    Err(e) => tracing::warn!("error incrementing URL (url={}): {}", page.url, e),
                }
            }
        }
    }
}

#[async_trait]
impl Scraper for Ao3Scraper {
    fn domain(&self) -> &str {
        DOMAIN
    }

    async fn scrape(&self, cancel: &CancellationToken, consumer: Consumer) -> Result<()> {
        let latest = self.latest_work(cancel).await?;
        tracing::info!("doc count {:?} = {}", DOMAIN, latest);

        let transports: Arc<dyn ClientSource> = Arc::new(
            TransportPool::new(
                self.proxy.as_ref(),
                &self.fetch,
                per_second_factory(self.config.requests_per_second),
            )
            .await?,
        );

        let (docs, doc_pages) = FetchPool::builder(self.config.workers)
            .clients(transports.clone())
            .spawn(cancel, &self.fetch)?;
        let (users, user_pages) = FetchPool::builder(self.config.workers)
            .clients(transports)
            .spawn(cancel, &self.fetch)?;

        tokio::join!(
            self.generate_works(cancel, &docs, latest),
            self.follow_bookmarkers(cancel, doc_pages, &users),
            self.emit_users(cancel, user_pages, &users, &consumer),
        );

        // the work generator only stops on cancellation
        Err(Cancelled.into())
    }

    fn normalize(&self, url: &Url) -> Result<String> {
        normalize_work(url)
    }

    fn links(&self, doc: &Document) -> Vec<Link> {
        let id = doc.url.rsplit('/').next().unwrap_or_default();
        vec![Link {
            name: "Download ePub".to_string(),
            url: format!(
                "http://download.archiveofourown.org/downloads/{}/book.epub",
                id
            ),
        }]
    }
}

fn story_url(work: u64) -> String {
    format!("https://archiveofourown.org/works/{}", work)
}

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| OurgraphError::Scrape {
        domain: DOMAIN.to_string(),
        message: format!("invalid selector {:?}: {}", css, e),
    })
}

fn text_of(element: &ElementRef<'_>, css: &Selector) -> String {
    element
        .select(css)
        .flat_map(|found| found.text())
        .collect::<String>()
}

/// Highest work id linked from a search results page
fn parse_latest(page: &Page) -> Result<Option<u64>> {
    let links = selector(".work .heading a")?;
    let document = page.html();
    Ok(document
        .select(&links)
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| href.rsplit('/').next()?.parse::<u64>().ok())
        .filter(|id| *id > 0)
        .max())
}

/// Profile URLs of everyone who bookmarked a work
fn parse_doc_bookmarks(page: &Page) -> Result<Vec<Url>> {
    let links = selector(".user .heading a")?;
    let document = page.html();

    let mut users = Vec::new();
    for href in document.select(&links).filter_map(|a| a.value().attr("href")) {
        if href.is_empty() {
            continue;
        }
        let profile = href.split("/pseuds/").next().unwrap_or(href);
        let url = page
            .resolve(profile)
            .ok_or_else(|| OurgraphError::Scrape {
                domain: DOMAIN.to_string(),
                message: format!("invalid bookmarker link {:?}", href),
            })?;
        users.push(url);
    }
    Ok(users)
}

/// A user and the works listed on one of their bookmark pages
fn parse_user_bookmarks(page: &Page) -> Result<User> {
    let bookmark = selector("ol.bookmark li.bookmark")?;
    let message = selector(".message")?;
    let heading_link = selector(".heading a")?;
    let author = selector(".heading a[rel=author]")?;
    let bookmarks = selector("dd.bookmarks")?;
    let kudos = selector("dd.kudos")?;
    let chapters = selector("dd.chapters")?;
    let words = selector("dd.words")?;
    let complete = selector(".complete-yes")?;
    let summary = selector("blockquote")?;
    let tag = selector("a.tag")?;

    let profile = page
        .url
        .as_str()
        .split("/bookmarks")
        .next()
        .unwrap_or_default()
        .to_string();
    let encoded_name = profile.rsplit('/').next().unwrap_or_default();
    let name = urlencoding::decode(encoded_name)
        .map_err(|e| OurgraphError::Scrape {
            domain: DOMAIN.to_string(),
            message: format!("invalid user name {:?}: {}", encoded_name, e),
        })?
        .into_owned();

    let mut user = User {
        username: make_slug(&name),
        name,
        urls: vec![profile],
        ..Default::default()
    };

    let document = page.html();
    for item in document.select(&bookmark) {
        if text_of(&item, &message).contains(DELETED_MESSAGE) {
            continue;
        }
        let Some(link) = item.select(&heading_link).next() else {
            continue;
        };
        let href = link.value().attr("href").unwrap_or_default();
        if href.contains("/series/") {
            continue;
        }
        let Some(target) = page.resolve(href) else {
            continue;
        };

        let mut doc = Document::new(normalize_work(&target)?, link.text().collect::<String>());
        doc.author = text_of(&item, &author);
        doc.reviews = parse_count(&text_of(&item, &bookmarks));
        doc.like_count = parse_count(&text_of(&item, &kudos));
        doc.chapters = parse_count(&text_of(&item, &chapters));
        doc.word_count = parse_count(&text_of(&item, &words));
        doc.complete = item.select(&complete).next().is_some();
        doc.description = text_of(&item, &summary).trim().to_string();
        doc.tags = remove_empty(
            item.select(&tag)
                .map(|t| make_slug(&t.text().collect::<String>()))
                .collect(),
        );
        user.likes.push(doc);
    }

    Ok(user)
}

/// `https://archiveofourown.org/works/<id>` for any URL under a work
fn normalize_work(url: &Url) -> Result<String> {
    url.path_segments()
        .and_then(|mut segments| {
            segments.find(|segment| *segment == "works")?;
            segments.next()?.parse::<u64>().ok()
        })
        .map(story_url)
        .ok_or_else(|| OurgraphError::Scrape {
            domain: DOMAIN.to_string(),
            message: format!("failed to parse URL {:?}", url.as_str()),
        })
}

/// The same listing one page further on
fn increment_page_url(url: &Url) -> Result<Url> {
    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    let next = match pairs.iter_mut().find(|(key, _)| key == "page") {
        Some((_, value)) => {
            let page: u64 = value.parse().map_err(|_| OurgraphError::Scrape {
                domain: DOMAIN.to_string(),
                message: format!("invalid page number {:?}", value),
            })?;
            *value = (page + 1).to_string();
            pairs
        }
        None => {
            pairs.push(("page".to_string(), "2".to_string()));
            pairs
        }
    };

    let mut incremented = url.clone();
    incremented.query_pairs_mut().clear().extend_pairs(next);
    Ok(incremented)
}
