//! Content fetching pipeline.
//!
//! Every candidate link goes through a three-way route: adapters that own
//! the URL fetch it natively over HTTP, PDF links are downloaded and
//! extracted directly, and everything else renders in a browser page with
//! challenge handling and proxy rotation. A semaphore bounds how many links
//! are in flight at once; results stream back in completion order.

pub mod challenge;
#[cfg(feature = "browser")]
pub mod chromium;
pub mod page;
pub mod pdf;

pub use challenge::{
    CaptchaSolver, ChallengeHandler, HttpCaptchaSolver, MockCaptchaSolver, is_challenge_page,
};
#[cfg(feature = "browser")]
pub use chromium::ChromiumEngine;
pub use page::{BrowserEngine, MockBrowserEngine, MockPageClient, PageClient};
pub use pdf::PdfExtractor;

use crate::config::CrawlerConfig;
use crate::error::FetchError;
use crate::gate::prefilter;
use crate::links::is_pdf_url;
use crate::sources::SourceRegistry;
use crate::types::{CandidateLink, FetchedContent};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Request patterns blocked in browser pages. Text extraction needs none of
/// these and skipping them cuts page load time substantially.
pub const BLOCKED_RESOURCE_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico", "*.css", "*.woff",
    "*.woff2", "*.ttf", "*.otf", "*.mp4", "*.webm", "*.mp3", "*.avi",
];

fn blocked_patterns() -> Vec<String> {
    BLOCKED_RESOURCE_PATTERNS
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Round-robin over configured egress proxies.
///
/// The first fetch attempt always goes direct; the pool is consulted only
/// after a failure, so a healthy site never burns proxy bandwidth.
pub struct ProxyPool {
    proxies: Vec<String>,
    cursor: AtomicUsize,
}

impl ProxyPool {
    pub fn new(proxies: Vec<String>) -> Self {
        Self {
            proxies,
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Next proxy in rotation; `None` when no proxies are configured.
    pub fn next(&self) -> Option<String> {
        if self.proxies.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.proxies.len();
        Some(self.proxies[idx].clone())
    }
}

/// Engine used when browser support is compiled out or switched off.
/// Adapter-native and PDF fetches still work; browser fetches fail fast.
pub struct DisabledBrowserEngine;

#[async_trait]
impl BrowserEngine for DisabledBrowserEngine {
    async fn open_page(&self, _proxy: Option<&str>) -> Result<Arc<dyn PageClient>, FetchError> {
        Err(FetchError::Session {
            message: "browser fetching is disabled; build with the `browser` feature".to_string(),
        })
    }

    async fn close(&self) {}
}

/// Fetches candidate links and pre-filters the extracted text.
///
/// Cheap to clone; clones share the browser engine, proxy pool, and
/// challenge handler.
#[derive(Clone)]
pub struct Fetcher {
    engine: Arc<dyn BrowserEngine>,
    registry: Arc<SourceRegistry>,
    challenges: Arc<ChallengeHandler>,
    pdf: PdfExtractor,
    proxies: Arc<ProxyPool>,
    fetch_timeout_secs: u64,
    max_attempts: u32,
    min_content_length: usize,
    max_concurrency: usize,
}

impl Fetcher {
    pub fn new(
        engine: Arc<dyn BrowserEngine>,
        registry: Arc<SourceRegistry>,
        solver: Option<Arc<dyn CaptchaSolver>>,
        http: reqwest::Client,
        config: &CrawlerConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            challenges: Arc::new(ChallengeHandler::new(solver)),
            pdf: PdfExtractor::new(http, config.pdf_timeout_secs),
            proxies: Arc::new(ProxyPool::new(config.proxies.clone())),
            fetch_timeout_secs: config.fetch_timeout_secs,
            max_attempts: config.max_attempts_per_link.max(1),
            min_content_length: config.min_content_length,
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    /// Fetch a batch of links concurrently. At most `max_concurrency` links
    /// are in flight at once; results arrive in completion order and the
    /// channel closes once every link has been tried.
    pub fn fetch_all(
        &self,
        links: Vec<CandidateLink>,
    ) -> mpsc::Receiver<Result<FetchedContent, FetchError>> {
        let (tx, rx) = mpsc::channel(self.max_concurrency);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));

        for link in links {
            let fetcher = self.clone();
            let sem = Arc::clone(&semaphore);
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(_permit) = sem.acquire().await else {
                    return;
                };
                let result = fetcher
                    .fetch_one(&link)
                    .await
                    .map(|text| FetchedContent { link, text });
                // A dropped receiver means the session stopped consuming.
                let _ = tx.send(result).await;
            });
        }
        rx
    }

    /// Fetch one link through whichever path owns it.
    pub async fn fetch_one(&self, link: &CandidateLink) -> Result<String, FetchError> {
        if let Some(adapter) = self.registry.get(&link.source) {
            if let Some(result) = adapter.fetch(&link.url).await {
                debug!(url = %link.url, source = %link.source, "adapter-native fetch");
                return self.accept(&link.url, result?);
            }
        }
        if is_pdf_url(&link.url) {
            let text = self.pdf.fetch(&link.url).await?;
            return self.accept(&link.url, text);
        }
        let text = self.fetch_via_browser(&link.url).await?;
        self.accept(&link.url, text)
    }

    /// Release every browser the engine started. Call once per session.
    pub async fn shutdown(&self) {
        self.engine.close().await;
    }

    /// Validate extracted text before it reaches the quality gate.
    fn accept(&self, url: &str, text: String) -> Result<String, FetchError> {
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(FetchError::EmptyBody {
                url: url.to_string(),
            });
        }
        if let Err(reason) = prefilter(&text, self.min_content_length) {
            return Err(FetchError::LowQuality {
                url: url.to_string(),
                reason,
            });
        }
        Ok(text)
    }

    /// Browser fetch with bounded retries. The first attempt goes direct;
    /// each retry backs off exponentially and rotates to the next proxy.
    async fn fetch_via_browser(&self, url: &str) -> Result<String, FetchError> {
        let mut proxy: Option<String> = None;
        let mut last_err: Option<FetchError> = None;

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let backoff = Duration::from_millis(500 * 2u64.pow((attempt - 2).min(4)));
                sleep(backoff).await;
            }
            match self.browser_attempt(url, proxy.as_deref()).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    warn!(url, attempt, error = %err, "browser fetch attempt failed");
                    last_err = Some(err);
                    proxy = self.proxies.next();
                }
            }
        }
        Err(last_err.unwrap_or_else(|| FetchError::Session {
            message: format!("no fetch attempts were made for {url}"),
        }))
    }

    async fn browser_attempt(&self, url: &str, proxy: Option<&str>) -> Result<String, FetchError> {
        let page = self.engine.open_page(proxy).await?;
        let result = self.extract_with_page(page.as_ref(), url).await;
        if let Err(err) = page.close().await {
            debug!(url, error = %err, "page close failed");
        }
        result
    }

    async fn extract_with_page(
        &self,
        page: &dyn PageClient,
        url: &str,
    ) -> Result<String, FetchError> {
        // Best effort; a page without request blocking still extracts.
        if let Err(err) = page.set_blocked_urls(&blocked_patterns()).await {
            debug!(url, error = %err, "request blocking unavailable");
        }

        let deadline = Duration::from_secs(self.fetch_timeout_secs);
        match timeout(deadline, page.navigate(url)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(FetchError::Timeout {
                    url: url.to_string(),
                    timeout_secs: self.fetch_timeout_secs,
                });
            }
        }

        let text = page.inner_text().await?;
        if is_challenge_page(&text) {
            return self.challenges.resolve(page, url).await;
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::MockSourceAdapter;

    const ARTICLE: &str = "Retrieval pipelines trade recall against cost. A crawler that \
        renders every page in a full browser captures script-generated content but pays \
        for it in latency and memory, while plain HTTP fetches are cheap and miss half \
        the modern web. Practical systems route each link to the cheapest path that can \
        actually read it and reserve the browser for pages that need one.";

    const CHALLENGE: &str = "Checking if the site connection is secure. \
        This may take a few seconds.";

    fn config() -> CrawlerConfig {
        CrawlerConfig {
            max_attempts_per_link: 1,
            ..CrawlerConfig::default()
        }
    }

    fn fetcher_with(
        engine: Arc<dyn BrowserEngine>,
        registry: SourceRegistry,
        config: &CrawlerConfig,
    ) -> Fetcher {
        Fetcher::new(
            engine,
            Arc::new(registry),
            None,
            reqwest::Client::new(),
            config,
        )
    }

    #[tokio::test]
    async fn adapter_native_fetch_skips_browser() {
        let adapter = Arc::new(MockSourceAdapter::new("arxiv"));
        adapter.set_content("https://arxiv.org/abs/2401.0001", ARTICLE);
        let mut registry = SourceRegistry::new();
        registry.register(adapter);

        let engine = Arc::new(MockBrowserEngine::new());
        let fetcher = fetcher_with(engine.clone(), registry, &config());

        let link = CandidateLink::new("https://arxiv.org/abs/2401.0001", "arxiv");
        let text = fetcher.fetch_one(&link).await.unwrap();
        assert_eq!(text, ARTICLE);
        assert_eq!(engine.opened(), 0);
    }

    #[tokio::test]
    async fn adapter_content_is_prefiltered() {
        let adapter = Arc::new(MockSourceAdapter::new("arxiv"));
        adapter.set_content("https://arxiv.org/abs/2401.0002", "too short");
        let mut registry = SourceRegistry::new();
        registry.register(adapter);

        let fetcher = fetcher_with(Arc::new(MockBrowserEngine::new()), registry, &config());
        let link = CandidateLink::new("https://arxiv.org/abs/2401.0002", "arxiv");
        let err = fetcher.fetch_one(&link).await.unwrap_err();
        assert!(matches!(err, FetchError::LowQuality { .. }));
    }

    #[tokio::test]
    async fn adapter_override_takes_precedence_over_pdf_route() {
        let adapter = Arc::new(MockSourceAdapter::new("arxiv"));
        adapter.set_content("https://arxiv.org/pdf/2401.0003.pdf", ARTICLE);
        let mut registry = SourceRegistry::new();
        registry.register(adapter);

        let fetcher = fetcher_with(Arc::new(MockBrowserEngine::new()), registry, &config());
        let link = CandidateLink::new("https://arxiv.org/pdf/2401.0003.pdf", "arxiv");
        assert_eq!(fetcher.fetch_one(&link).await.unwrap(), ARTICLE);
    }

    #[tokio::test]
    async fn pdf_urls_route_to_http_download() {
        let fetcher = fetcher_with(
            Arc::new(MockBrowserEngine::new()),
            SourceRegistry::new(),
            &config(),
        );
        // Nothing listens on port 1; the download fails without touching
        // the browser path.
        let link = CandidateLink::new("http://127.0.0.1:1/paper.pdf", "web");
        let err = fetcher.fetch_one(&link).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Http { .. } | FetchError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn browser_path_extracts_text() {
        let engine = Arc::new(MockBrowserEngine::new());
        engine.set_text_for("https://example.com/post", ARTICLE);

        let fetcher = fetcher_with(engine.clone(), SourceRegistry::new(), &config());
        let link = CandidateLink::new("https://example.com/post", "web");
        let text = fetcher.fetch_one(&link).await.unwrap();
        assert_eq!(text, ARTICLE);

        assert_eq!(engine.opened(), 1);
        let pages = engine.pages.lock().unwrap();
        assert_eq!(pages[0].call_count("set_blocked_urls"), 1);
        assert_eq!(pages[0].call_count("navigate"), 1);
        assert!(*pages[0].closed.lock().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn challenge_resolved_then_accepted() {
        let page = Arc::new(MockPageClient::new());
        page.queue_text(CHALLENGE);
        page.queue_text(ARTICLE);
        let engine = Arc::new(MockBrowserEngine::new());
        engine.prepare_page(Arc::clone(&page));

        let fetcher = fetcher_with(engine, SourceRegistry::new(), &config());
        let link = CandidateLink::new("https://example.com/guarded", "web");
        let text = fetcher.fetch_one(&link).await.unwrap();
        assert_eq!(text, ARTICLE);
        // The generic-wait simulation ran before the second extract.
        assert!(page.call_count("evaluate") >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn proxy_rotates_after_challenge_failure() {
        let stuck = Arc::new(MockPageClient::new());
        stuck.set_text(CHALLENGE);
        let clean = Arc::new(MockPageClient::new());
        clean.set_text(ARTICLE);

        let engine = Arc::new(MockBrowserEngine::new());
        engine.prepare_page(stuck);
        engine.prepare_page(clean);

        let config = CrawlerConfig {
            max_attempts_per_link: 2,
            proxies: vec!["http://exit1:3128".to_string()],
            ..CrawlerConfig::default()
        };
        let fetcher = fetcher_with(engine.clone(), SourceRegistry::new(), &config);

        let link = CandidateLink::new("https://example.com/guarded", "web");
        let text = fetcher.fetch_one(&link).await.unwrap();
        assert_eq!(text, ARTICLE);

        let proxies = engine.proxies_seen.lock().unwrap().clone();
        assert_eq!(proxies, vec![None, Some("http://exit1:3128".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_exhausted_returns_last_error() {
        let engine = Arc::new(MockBrowserEngine::new());
        for _ in 0..2 {
            let page = Arc::new(MockPageClient::new());
            page.set_text(CHALLENGE);
            engine.prepare_page(page);
        }

        let config = CrawlerConfig {
            max_attempts_per_link: 2,
            ..CrawlerConfig::default()
        };
        let fetcher = fetcher_with(engine.clone(), SourceRegistry::new(), &config);

        let link = CandidateLink::new("https://example.com/guarded", "web");
        let err = fetcher.fetch_one(&link).await.unwrap_err();
        assert!(matches!(err, FetchError::ChallengeUnsolvable { .. }));
        assert_eq!(engine.opened(), 2);
    }

    #[tokio::test]
    async fn navigation_error_propagates() {
        let page = Arc::new(MockPageClient::new());
        page.set_navigate_error(FetchError::Navigation {
            url: "https://example.com/dead".into(),
            message: "net::ERR_NAME_NOT_RESOLVED".into(),
        });
        let engine = Arc::new(MockBrowserEngine::new());
        engine.prepare_page(page);

        let fetcher = fetcher_with(engine, SourceRegistry::new(), &config());
        let link = CandidateLink::new("https://example.com/dead", "web");
        let err = fetcher.fetch_one(&link).await.unwrap_err();
        assert!(matches!(err, FetchError::Navigation { .. }));
    }

    #[tokio::test]
    async fn empty_browser_text_is_empty_body() {
        let engine = Arc::new(MockBrowserEngine::new());
        engine.set_default_text("");

        let fetcher = fetcher_with(engine, SourceRegistry::new(), &config());
        let link = CandidateLink::new("https://example.com/blank", "web");
        let err = fetcher.fetch_one(&link).await.unwrap_err();
        assert!(matches!(err, FetchError::EmptyBody { .. }));
    }

    #[tokio::test]
    async fn disabled_engine_reports_session_error() {
        let fetcher = fetcher_with(
            Arc::new(DisabledBrowserEngine),
            SourceRegistry::new(),
            &config(),
        );
        let link = CandidateLink::new("https://example.com/post", "web");
        let err = fetcher.fetch_one(&link).await.unwrap_err();
        assert!(matches!(err, FetchError::Session { .. }));
    }

    #[tokio::test]
    async fn fetch_all_streams_results_and_closes() {
        let adapter = Arc::new(MockSourceAdapter::new("arxiv"));
        for n in 1..=3 {
            adapter.set_content(&format!("https://arxiv.org/abs/2401.000{n}"), ARTICLE);
        }
        let mut registry = SourceRegistry::new();
        registry.register(adapter);

        let fetcher = fetcher_with(Arc::new(MockBrowserEngine::new()), registry, &config());
        let links: Vec<CandidateLink> = (1..=3)
            .map(|n| CandidateLink::new(format!("https://arxiv.org/abs/2401.000{n}"), "arxiv"))
            .collect();

        let mut rx = fetcher.fetch_all(links);
        let mut ok = 0;
        while let Some(result) = rx.recv().await {
            assert_eq!(result.unwrap().text, ARTICLE);
            ok += 1;
        }
        assert_eq!(ok, 3);
    }

    #[tokio::test]
    async fn fetch_all_isolates_failures() {
        let adapter = Arc::new(MockSourceAdapter::new("arxiv"));
        adapter.set_content("https://arxiv.org/abs/1", ARTICLE);
        adapter.set_content("https://arxiv.org/abs/2", "junk");
        adapter.set_content("https://arxiv.org/abs/3", ARTICLE);
        let mut registry = SourceRegistry::new();
        registry.register(adapter);

        let fetcher = fetcher_with(Arc::new(MockBrowserEngine::new()), registry, &config());
        let links: Vec<CandidateLink> = (1..=3)
            .map(|n| CandidateLink::new(format!("https://arxiv.org/abs/{n}"), "arxiv"))
            .collect();

        let mut rx = fetcher.fetch_all(links);
        let (mut ok, mut failed) = (0, 0);
        while let Some(result) = rx.recv().await {
            match result {
                Ok(_) => ok += 1,
                Err(err) => {
                    assert!(matches!(err, FetchError::LowQuality { .. }));
                    failed += 1;
                }
            }
        }
        assert_eq!((ok, failed), (2, 1));
    }

    struct CountingAdapter {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl crate::sources::SourceAdapter for CountingAdapter {
        fn name(&self) -> &str {
            "counting"
        }

        async fn expand(&self, _query: &str) -> Result<Vec<String>, FetchError> {
            Ok(Vec::new())
        }

        async fn fetch(&self, _url: &str) -> Option<Result<String, FetchError>> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Some(Ok(ARTICLE.to_string()))
        }
    }

    async fn run_with_bound(bound: usize) -> (usize, usize) {
        let adapter = Arc::new(CountingAdapter {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let mut registry = SourceRegistry::new();
        registry.register(adapter.clone());

        let config = CrawlerConfig {
            max_concurrency: bound,
            ..CrawlerConfig::default()
        };
        let fetcher = fetcher_with(Arc::new(MockBrowserEngine::new()), registry, &config);

        let links: Vec<CandidateLink> = (0..10)
            .map(|n| CandidateLink::new(format!("https://example.com/{n}"), "counting"))
            .collect();
        let mut rx = fetcher.fetch_all(links);
        let mut received = 0;
        while let Some(result) = rx.recv().await {
            assert!(result.is_ok());
            received += 1;
        }
        (received, adapter.peak.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn fetch_all_respects_admission_bound() {
        let (received, peak) = run_with_bound(1).await;
        assert_eq!(received, 10);
        assert_eq!(peak, 1);

        let (received, peak) = run_with_bound(3).await;
        assert_eq!(received, 10);
        assert!(peak <= 3);

        let (received, _) = run_with_bound(10).await;
        assert_eq!(received, 10);
    }

    #[test]
    fn proxy_pool_rotates_and_wraps() {
        let pool = ProxyPool::new(vec!["a".into(), "b".into()]);
        assert_eq!(pool.next().as_deref(), Some("a"));
        assert_eq!(pool.next().as_deref(), Some("b"));
        assert_eq!(pool.next().as_deref(), Some("a"));
    }

    #[test]
    fn empty_proxy_pool_yields_none() {
        let pool = ProxyPool::new(Vec::new());
        assert!(pool.is_empty());
        assert_eq!(pool.next(), None);
    }
}
