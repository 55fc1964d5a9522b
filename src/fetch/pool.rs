//! Rate-limited fetch worker pool
//!
//! Workers pull URLs from two queues: a bounded normal queue, whose
//! [`FetchPool::schedule`] blocks when full, and a small priority queue,
//! whose [`FetchPool::schedule_priority`] drops when full. A worker waiting
//! for work takes a pending priority job before a pending normal one.
//!
//! Every worker owns a sender for the output queue and the pool keeps none,
//! so the output closes exactly when the last worker has exited.

use crate::config::FetchConfig;
use crate::fetch::{build_http_client, FetchError, Page};
use crate::ratelimit::RateLimiter;
use crate::transport::{ClientSource, SharedClient};
use crate::Cancelled;
use reqwest::StatusCode;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Default capacity of the normal job queue and of the output queue
pub const DEFAULT_CAPACITY: usize = 16;

/// Extra tokens paid after a "too many requests" response
const OVERLOAD_PENALTY_TOKENS: u32 = 3;

/// Configures and spawns a [`FetchPool`]
pub struct FetchPoolBuilder {
    workers: usize,
    job_capacity: usize,
    output_capacity: usize,
    limiter: RateLimiter,
    clients: Option<Arc<dyn ClientSource>>,
}

impl FetchPoolBuilder {
    /// Rate limiter paid once per fetch, before a client is obtained
    pub fn limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Where workers get their HTTP clients; defaults to one shared client
    pub fn clients(mut self, clients: Arc<dyn ClientSource>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn job_capacity(mut self, capacity: usize) -> Self {
        self.job_capacity = capacity.max(1);
        self
    }

    pub fn output_capacity(mut self, capacity: usize) -> Self {
        self.output_capacity = capacity.max(1);
        self
    }

    /// Starts the workers and returns the pool with its output queue
    ///
    /// # Errors
    ///
    /// Fails only when the default shared client cannot be built.
    pub fn spawn(
        self,
        cancel: &CancellationToken,
        fetch: &FetchConfig,
    ) -> Result<(FetchPool, mpsc::Receiver<Page>), FetchError> {
        let clients = match self.clients {
            Some(clients) => clients,
            None => Arc::new(SharedClient::new(build_http_client(fetch, None)?)),
        };

        let (jobs_tx, jobs_rx) = mpsc::channel(self.job_capacity);
        let (priority_tx, priority_rx) = mpsc::channel(self.workers.max(1));
        let (output_tx, output_rx) = mpsc::channel(self.output_capacity);

        let queues = Arc::new(tokio::sync::Mutex::new(Queues {
            priority: priority_rx,
            jobs: jobs_rx,
        }));
        let limiter = Arc::new(self.limiter);

        let handles = (0..self.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    queues: queues.clone(),
                    requeue: jobs_tx.downgrade(),
                    output: output_tx.clone(),
                    limiter: limiter.clone(),
                    clients: clients.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        tracing::debug!("spawned fetch pool with {} workers", self.workers);

        let pool = FetchPool {
            jobs: Mutex::new(Some(jobs_tx)),
            priority: priority_tx,
            closing: CancellationToken::new(),
            workers: tokio::sync::Mutex::new(handles),
        };
        Ok((pool, output_rx))
    }
}

/// A set of fetch workers fed by a normal and a priority job queue
pub struct FetchPool {
    /// `None` once the pool has been closed
    jobs: Mutex<Option<mpsc::Sender<String>>>,
    priority: mpsc::Sender<String>,
    closing: CancellationToken,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl FetchPool {
    /// Starts configuring a pool
    ///
    /// Defaults: unlimited pool limiter, one shared client built from the
    /// fetch configuration, and [`DEFAULT_CAPACITY`] for both the job queue
    /// and the output queue. The priority queue holds one job per worker.
    ///
    /// # Arguments
    ///
    /// * `workers` - Number of fetch workers to spawn
    ///
    /// # Returns
    ///
    /// A builder; call [`FetchPoolBuilder::spawn`] to start the workers
    pub fn builder(workers: usize) -> FetchPoolBuilder {
        FetchPoolBuilder {
            workers,
            job_capacity: DEFAULT_CAPACITY,
            output_capacity: DEFAULT_CAPACITY,
            limiter: RateLimiter::unlimited(),
            clients: None,
        }
    }

    /// Queues a URL, waiting for space when the queue is full
    ///
    /// # Errors
    ///
    /// * `FetchError::Cancelled` - `cancel` fired while waiting
    /// * `FetchError::PoolClosed` - the pool no longer accepts work
    pub async fn schedule(
        &self,
        cancel: &CancellationToken,
        url: impl Into<String>,
    ) -> Result<(), FetchError> {
        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(FetchError::PoolClosed)?;

        tokio::select! {
            _ = cancel.cancelled() => Err(Cancelled.into()),
            sent = sender.send(url.into()) => sent.map_err(|_| FetchError::PoolClosed),
        }
    }

    /// Queues a URL ahead of normal jobs without ever waiting
    ///
    /// Returns `false` when the job was dropped because the priority queue
    /// is full or the pool is closing.
    pub fn schedule_priority(&self, url: impl Into<String>) -> bool {
        if self.closing.is_cancelled() {
            return false;
        }
        self.priority.try_send(url.into()).is_ok()
    }

    /// Stops accepting normal jobs and waits for every worker to exit
    ///
    /// Workers drain both queues first. Once this returns the output queue
    /// has been closed. Calling it again is a no-op.
    pub async fn close(&self) {
        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
        self.closing.cancel();

        let handles = std::mem::take(&mut *self.workers.lock().await);
        let count = handles.len();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("fetch worker panicked: {}", e);
            }
        }
        if count > 0 {
            tracing::debug!("fetch pool closed after {} workers exited", count);
        }
    }
}

struct Queues {
    priority: mpsc::Receiver<String>,
    jobs: mpsc::Receiver<String>,
}

struct Worker {
    id: usize,
    queues: Arc<tokio::sync::Mutex<Queues>>,
    /// Weak so that a worker never keeps the normal queue open by itself
    requeue: mpsc::WeakSender<String>,
    output: mpsc::Sender<Page>,
    limiter: Arc<RateLimiter>,
    clients: Arc<dyn ClientSource>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        while let Some(url) = self.next_job().await {
            match self.fetch(&url).await {
                Ok(()) => {}
                Err(FetchError::Cancelled(_)) | Err(FetchError::OutputClosed) => break,
                Err(e @ FetchError::TooManyRequests { .. }) => {
                    tracing::debug!("worker {}: {}", self.id, e);
                }
                Err(e) => tracing::warn!("fetch failed: {}", e),
            }
        }
        tracing::trace!("fetch worker {} exiting", self.id);
    }

    /// Next URL to fetch, or `None` when cancelled or when the normal queue
    /// is closed and both queues are drained
    async fn next_job(&self) -> Option<String> {
        let mut queues = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            queues = self.queues.lock() => queues,
        };
        let Queues { priority, jobs } = &mut *queues;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            Some(url) = priority.recv() => Some(url),
            job = jobs.recv() => match job {
                Some(url) => Some(url),
                None => match priority.try_recv() {
                    Ok(url) => Some(url),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
                },
            },
        }
    }

    async fn fetch(&self, url: &str) -> Result<(), FetchError> {
        let parsed = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;

        self.limiter.take(&self.cancel).await?;
        let client = self.clients.client(&self.cancel).await?;

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Cancelled.into()),
            response = client.get(parsed.clone()).send() => response,
        }
        .map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            self.requeue(url);
            self.limiter
                .penalize(OVERLOAD_PENALTY_TOKENS, &self.cancel)
                .await?;
            return Err(FetchError::TooManyRequests {
                url: url.to_string(),
            });
        }
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Cancelled.into()),
            body = response.text() => body,
        }
        .map_err(|source| FetchError::Body {
            url: url.to_string(),
            source,
        })?;

        let page = Page::new(parsed, status.as_u16(), body);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Cancelled.into()),
            sent = self.output.send(page) => sent.map_err(|_| FetchError::OutputClosed),
        }
    }

    /// Best-effort: dropped when the queue is full or already closed
    fn requeue(&self, url: &str) {
        let requeued = self
            .requeue
            .upgrade()
            .is_some_and(|jobs| jobs.try_send(url.to_string()).is_ok());
        if !requeued {
            tracing::debug!("dropped rate limited job {}", url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reqwest::Client;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tokio::time::Instant;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Hands out clients only as permits are added, announcing each request
    struct GatedClients {
        client: Client,
        gate: Semaphore,
        entered: mpsc::UnboundedSender<()>,
    }

    impl GatedClients {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
            let (entered, rx) = mpsc::unbounded_channel();
            let clients = Arc::new(Self {
                client: Client::new(),
                gate: Semaphore::new(0),
                entered,
            });
            (clients, rx)
        }
    }

    #[async_trait]
    impl ClientSource for GatedClients {
        async fn client(&self, cancel: &CancellationToken) -> Result<Client, Cancelled> {
            let _ = self.entered.send(());
            tokio::select! {
                _ = cancel.cancelled() => Err(Cancelled),
                permit = self.gate.acquire() => {
                    permit.map_err(|_| Cancelled)?.forget();
                    Ok(self.client.clone())
                }
            }
        }
    }

    /// Shared client that records when each request was released
    struct RecordingClients {
        client: Client,
        fetched: Mutex<Vec<Instant>>,
    }

    impl RecordingClients {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                client: Client::new(),
                fetched: Mutex::new(Vec::new()),
            })
        }

        fn fetched(&self) -> Vec<Instant> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClientSource for RecordingClients {
        async fn client(&self, _cancel: &CancellationToken) -> Result<Client, Cancelled> {
            self.fetched.lock().unwrap().push(Instant::now());
            Ok(self.client.clone())
        }
    }

    async fn ok_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html></html>"))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_fetches_pages_and_closes_output() {
        let server = ok_server().await;
        let cancel = CancellationToken::new();
        let (pool, mut output) = FetchPool::builder(3)
            .spawn(&cancel, &FetchConfig::default())
            .unwrap();

        for i in 0..5 {
            pool.schedule(&cancel, format!("{}/page{}", server.uri(), i))
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            let page = tokio::time::timeout(Duration::from_secs(5), output.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(page.status, 200);
            seen.push(page.url.path().to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["/page0", "/page1", "/page2", "/page3", "/page4"]);

        // workers are still alive, so the output must still be open
        assert!(matches!(
            output.try_recv(),
            Err(mpsc::error::TryRecvError::Empty)
        ));

        pool.close().await;
        assert!(output.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_drains_pending_jobs() {
        let server = ok_server().await;
        let cancel = CancellationToken::new();
        let (pool, mut output) = FetchPool::builder(1)
            .output_capacity(32)
            .spawn(&cancel, &FetchConfig::default())
            .unwrap();

        for i in 0..10 {
            pool.schedule(&cancel, format!("{}/{}", server.uri(), i))
                .await
                .unwrap();
        }
        pool.close().await;

        let mut count = 0;
        while output.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 10);

        assert!(matches!(
            pool.schedule(&cancel, format!("{}/late", server.uri())).await,
            Err(FetchError::PoolClosed)
        ));
        assert!(!pool.schedule_priority(format!("{}/late", server.uri())));
    }

    #[tokio::test]
    async fn test_non_ok_status_is_dropped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let (pool, mut output) = FetchPool::builder(2)
            .spawn(&cancel, &FetchConfig::default())
            .unwrap();
        pool.schedule(&cancel, format!("{}/missing", server.uri()))
            .await
            .unwrap();
        pool.schedule(&cancel, format!("{}/ok", server.uri()))
            .await
            .unwrap();
        pool.close().await;

        let page = output.recv().await.unwrap();
        assert_eq!(page.url.path(), "/ok");
        assert_eq!(page.body, "ok");
        assert!(output.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_too_many_requests_is_requeued() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(200).set_body_string("finally"))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let (pool, mut output) = FetchPool::builder(1)
            .spawn(&cancel, &FetchConfig::default())
            .unwrap();
        pool.schedule(&cancel, format!("{}/busy", server.uri()))
            .await
            .unwrap();

        let page = tokio::time::timeout(Duration::from_secs(5), output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(page.body, "finally");

        pool.close().await;
        assert!(output.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_priority_jobs_go_first() {
        let server = ok_server().await;
        let cancel = CancellationToken::new();
        let (clients, mut entered) = GatedClients::new();
        let (pool, mut output) = FetchPool::builder(1)
            .clients(clients.clone())
            .spawn(&cancel, &FetchConfig::default())
            .unwrap();

        pool.schedule(&cancel, format!("{}/n1", server.uri()))
            .await
            .unwrap();
        // the single worker now holds n1 and waits at the gate
        entered.recv().await.unwrap();

        pool.schedule(&cancel, format!("{}/n2", server.uri()))
            .await
            .unwrap();
        pool.schedule(&cancel, format!("{}/n3", server.uri()))
            .await
            .unwrap();
        assert!(pool.schedule_priority(format!("{}/p1", server.uri())));

        clients.gate.add_permits(4);

        let mut order = Vec::new();
        for _ in 0..4 {
            let page = tokio::time::timeout(Duration::from_secs(5), output.recv())
                .await
                .unwrap()
                .unwrap();
            order.push(page.url.path().to_string());
        }
        assert_eq!(order, vec!["/n1", "/p1", "/n2", "/n3"]);

        pool.close().await;
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_drained() {
        let server = ok_server().await;
        let cancel = CancellationToken::new();
        let (clients, mut entered) = GatedClients::new();
        let (pool, mut output) = FetchPool::builder(1)
            .job_capacity(2)
            .clients(clients.clone())
            .spawn(&cancel, &FetchConfig::default())
            .unwrap();
        let pool = Arc::new(pool);

        pool.schedule(&cancel, format!("{}/1", server.uri()))
            .await
            .unwrap();
        entered.recv().await.unwrap();
        pool.schedule(&cancel, format!("{}/2", server.uri()))
            .await
            .unwrap();
        pool.schedule(&cancel, format!("{}/3", server.uri()))
            .await
            .unwrap();

        // queue is full: a fourth job must wait
        let blocked = tokio::time::timeout(
            Duration::from_millis(200),
            pool.schedule(&cancel, format!("{}/4", server.uri())),
        )
        .await;
        assert!(blocked.is_err());

        let waiting = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            let url = format!("{}/4", server.uri());
            tokio::spawn(async move { pool.schedule(&cancel, url).await })
        };

        clients.gate.add_permits(10);
        let scheduled = tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap();
        assert!(scheduled.is_ok());

        for _ in 0..4 {
            tokio::time::timeout(Duration::from_secs(5), output.recv())
                .await
                .unwrap()
                .unwrap();
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn test_full_priority_queue_drops_immediately() {
        let server = ok_server().await;
        let cancel = CancellationToken::new();
        let (clients, mut entered) = GatedClients::new();
        let (pool, _output) = FetchPool::builder(1)
            .clients(clients.clone())
            .spawn(&cancel, &FetchConfig::default())
            .unwrap();

        pool.schedule(&cancel, format!("{}/busy", server.uri()))
            .await
            .unwrap();
        entered.recv().await.unwrap();

        // priority capacity equals the worker count
        assert!(pool.schedule_priority(format!("{}/p1", server.uri())));
        assert!(!pool.schedule_priority(format!("{}/p2", server.uri())));

        cancel.cancel();
        pool.close().await;
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_schedule() {
        let server = ok_server().await;
        let cancel = CancellationToken::new();
        let (clients, mut entered) = GatedClients::new();
        let (pool, _output) = FetchPool::builder(1)
            .job_capacity(1)
            .clients(clients)
            .spawn(&cancel, &FetchConfig::default())
            .unwrap();

        // the worker holds the first job at the gate, the second fills the queue
        pool.schedule(&cancel, format!("{}/1", server.uri()))
            .await
            .unwrap();
        entered.recv().await.unwrap();
        pool.schedule(&cancel, format!("{}/2", server.uri()))
            .await
            .unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            pool.schedule(&cancel, format!("{}/3", server.uri())),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(FetchError::Cancelled(_))));

        pool.close().await;
    }

    #[tokio::test]
    async fn test_too_many_requests_pays_penalty_before_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(200).set_body_string("finally"))
            .mount(&server)
            .await;

        let interval = Duration::from_millis(100);
        let cancel = CancellationToken::new();
        let clients = RecordingClients::new();
        let (pool, mut output) = FetchPool::builder(1)
            .limiter(RateLimiter::with_interval(interval))
            .clients(clients.clone())
            .spawn(&cancel, &FetchConfig::default())
            .unwrap();
        pool.schedule(&cancel, format!("{}/busy", server.uri()))
            .await
            .unwrap();

        let page = tokio::time::timeout(Duration::from_secs(5), output.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(page.body, "finally");

        // one token for the first request, three for the penalty
        let fetched = clients.fetched();
        assert_eq!(fetched.len(), 2);
        assert!(
            fetched[1] - fetched[0] >= interval * 4 - Duration::from_millis(50),
            "retry came after {:?}",
            fetched[1] - fetched[0]
        );

        pool.close().await;
    }

    #[tokio::test]
    async fn test_rate_limit_holds_across_workers() {
        let server = ok_server().await;
        let interval = Duration::from_millis(50);
        let cancel = CancellationToken::new();
        let clients = RecordingClients::new();
        let (pool, mut output) = FetchPool::builder(8)
            .limiter(RateLimiter::with_interval(interval))
            .clients(clients.clone())
            .spawn(&cancel, &FetchConfig::default())
            .unwrap();

        for i in 0..10 {
            pool.schedule(&cancel, format!("{}/{}", server.uri(), i))
                .await
                .unwrap();
        }
        for _ in 0..10 {
            tokio::time::timeout(Duration::from_secs(5), output.recv())
                .await
                .unwrap()
                .unwrap();
        }
        pool.close().await;

        let mut fetched = clients.fetched();
        fetched.sort();
        assert_eq!(fetched.len(), 10);
        for pair in fetched.windows(2) {
            assert!(
                pair[1] - pair[0] >= interval - Duration::from_millis(20),
                "requests only {:?} apart",
                pair[1] - pair[0]
            );
        }
        assert!(fetched[9] - fetched[0] >= interval * 9 - Duration::from_millis(20));
    }

    #[tokio::test]
    async fn test_cancellation_stops_workers() {
        let cancel = CancellationToken::new();
        let (clients, _entered) = GatedClients::new();
        let (pool, mut output) = FetchPool::builder(4)
            .clients(clients)
            .spawn(&cancel, &FetchConfig::default())
            .unwrap();

        pool.schedule(&cancel, "http://localhost/never").await.unwrap();
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(5), pool.close())
            .await
            .unwrap();
        assert!(output.recv().await.is_none());
    }
}
