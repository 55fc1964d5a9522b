//! End-to-end tests for the scrape and upload pipeline
//!
//! Scripted scrapers feed an orchestrator backed by the in-memory store, or
//! by a wiremock server speaking the Dgraph HTTP API.

use async_trait::async_trait;
use ourgraph::pipeline::Consumer;
use ourgraph::store::{DgraphStore, MemoryStore, RetryPolicy};
use ourgraph::{Cancelled, Document, Link, Orchestrator, OurgraphError, Scraper, User};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Emits a fixed batch of entities and then finishes
struct ScriptedScraper {
    users: Vec<User>,
    documents: Vec<Document>,
}

#[async_trait]
impl Scraper for ScriptedScraper {
    fn domain(&self) -> &str {
        "example.org"
    }

    async fn scrape(
        &self,
        cancel: &CancellationToken,
        consumer: Consumer,
    ) -> Result<(), OurgraphError> {
        for user in &self.users {
            consumer.send_user(cancel, user.clone()).await?;
        }
        for doc in &self.documents {
            consumer.send_document(cancel, doc.clone()).await?;
        }
        Ok(())
    }

    fn normalize(&self, url: &Url) -> Result<String, OurgraphError> {
        Ok(url.to_string())
    }

    fn links(&self, _doc: &Document) -> Vec<Link> {
        Vec::new()
    }
}

/// Blocks until cancelled, like a scraper with an endless frontier
struct EndlessScraper {
    stopped: Arc<AtomicBool>,
}

#[async_trait]
impl Scraper for EndlessScraper {
    fn domain(&self) -> &str {
        "endless.example.org"
    }

    async fn scrape(
        &self,
        cancel: &CancellationToken,
        _consumer: Consumer,
    ) -> Result<(), OurgraphError> {
        cancel.cancelled().await;
        self.stopped.store(true, Ordering::SeqCst);
        Err(Cancelled.into())
    }

    fn normalize(&self, url: &Url) -> Result<String, OurgraphError> {
        Ok(url.to_string())
    }

    fn links(&self, _doc: &Document) -> Vec<Link> {
        Vec::new()
    }
}

struct FailingScraper;

#[async_trait]
impl Scraper for FailingScraper {
    fn domain(&self) -> &str {
        "broken.example.org"
    }

    async fn scrape(
        &self,
        _cancel: &CancellationToken,
        _consumer: Consumer,
    ) -> Result<(), OurgraphError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Err(OurgraphError::Scrape {
            domain: self.domain().to_string(),
            message: "latest work id missing".to_string(),
        })
    }

    fn normalize(&self, url: &Url) -> Result<String, OurgraphError> {
        Ok(url.to_string())
    }

    fn links(&self, _doc: &Document) -> Vec<Link> {
        Vec::new()
    }
}

fn alice() -> User {
    let mut user = User::new("Alice", "https://example.org/users/alice");
    user.likes = vec![Document::new("https://example.org/works/1", "Book One")];
    user
}

#[tokio::test]
async fn test_pipeline_uploads_scraped_entities() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::with_store(store.clone()).uploaders(2);
    let scraper = ScriptedScraper {
        users: vec![alice()],
        documents: vec![Document::new("https://example.org/works/2", "Book Two")],
    };

    let cancel = CancellationToken::new();
    orchestrator
        .run(vec![Arc::new(scraper)], &cancel)
        .await
        .expect("pipeline should finish once the scraper is done");

    let users = store.find("username", &alice().username);
    assert_eq!(users.len(), 1);
    let works = store.find("url", "https://example.org/works/1");
    assert_eq!(works.len(), 1);
    assert_eq!(store.likes(&users[0]), works);
    assert_eq!(store.find("url", "https://example.org/works/2").len(), 1);
    assert_eq!(store.node_count(), 3);

    assert_eq!(orchestrator.stats().total(), 2);
    assert_eq!(orchestrator.stats().snapshot().get("example.org"), Some(&2));
    assert!(!cancel.is_cancelled());
}

#[tokio::test]
async fn test_reemitted_user_is_uploaded_once() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::with_store(store.clone()).uploaders(1);
    let scraper = ScriptedScraper {
        users: vec![alice(), alice(), alice()],
        documents: Vec::new(),
    };

    orchestrator
        .run(vec![Arc::new(scraper)], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.node_count(), 2);
    assert_eq!(store.mutation_count(), 1);
    assert_eq!(orchestrator.stats().total(), 1);
}

#[tokio::test]
async fn test_user_without_likes_is_not_stored() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::with_store(store.clone());
    let scraper = ScriptedScraper {
        users: vec![User::new("Lurker", "https://example.org/users/lurker")],
        documents: Vec::new(),
    };

    orchestrator
        .run(vec![Arc::new(scraper)], &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(store.node_count(), 0);
    assert_eq!(store.mutation_count(), 0);
}

#[tokio::test]
async fn test_scraper_failure_cancels_pipeline() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::with_store(store);
    let stopped = Arc::new(AtomicBool::new(false));
    let scrapers: Vec<Arc<dyn Scraper>> = vec![
        Arc::new(EndlessScraper {
            stopped: stopped.clone(),
        }),
        Arc::new(FailingScraper),
    ];

    let cancel = CancellationToken::new();
    let result = tokio::time::timeout(Duration::from_secs(5), orchestrator.run(scrapers, &cancel))
        .await
        .expect("pipeline should unwind after the failure");

    match result {
        Err(OurgraphError::Scrape { domain, .. }) => assert_eq!(domain, "broken.example.org"),
        other => panic!("expected scrape failure, got {:?}", other),
    }
    assert!(cancel.is_cancelled());
    assert!(stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_cancellation_is_a_clean_stop() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Orchestrator::with_store(store);
    let stopped = Arc::new(AtomicBool::new(false));
    let scrapers: Vec<Arc<dyn Scraper>> = vec![Arc::new(EndlessScraper {
        stopped: stopped.clone(),
    })];

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(5), orchestrator.run(scrapers, &cancel))
        .await
        .expect("pipeline should stop after cancellation");

    assert!(result.is_ok(), "cancellation is not an error: {:?}", result);
    assert!(stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_unhealthy_store_stops_before_scraping() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(DgraphStore::with_client(reqwest::Client::new(), &server.uri()));
    let orchestrator = Orchestrator::with_store(store).retry(RetryPolicy::none());
    let stopped = Arc::new(AtomicBool::new(false));
    let scrapers: Vec<Arc<dyn Scraper>> = vec![Arc::new(EndlessScraper {
        stopped: stopped.clone(),
    })];

    let result = orchestrator.run(scrapers, &CancellationToken::new()).await;

    assert!(matches!(result, Err(OurgraphError::Store(_))));
    assert!(!stopped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_pipeline_writes_through_dgraph_api() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!([{"status": "healthy"}])),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"users": [], "docs": []}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/mutate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": {"code": "Success", "uids": {"user": "0x1", "n0": "0x2"}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(DgraphStore::with_client(reqwest::Client::new(), &server.uri()));
    let orchestrator = Orchestrator::with_store(store).uploaders(1);
    let scraper = ScriptedScraper {
        users: vec![alice()],
        documents: Vec::new(),
    };

    orchestrator
        .run(vec![Arc::new(scraper)], &CancellationToken::new())
        .await
        .unwrap();

    let cached = orchestrator
        .cache()
        .get(ourgraph::schema::EntityKind::User, &alice().username)
        .expect("stored user should be cached");
    assert_eq!(cached.uid, "0x1");
}
