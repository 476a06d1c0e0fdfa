//! Page and browser abstractions for the fetch pipeline.
//!
//! `PageClient` covers the handful of page operations the pipeline needs
//! (navigate, text extraction, challenge probing); `BrowserEngine` hands out
//! pages, optionally routed through an egress proxy. Both come with mock
//! implementations so the pipeline is testable without a Chrome process.

use crate::error::FetchError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

/// One open browser page.
///
/// Implementors include `MockPageClient` (for tests) and `ChromiumPage`
/// (wrapping chromiumoxide, behind the `browser` feature).
#[async_trait]
pub trait PageClient: Send + Sync {
    /// Navigate to the given URL and wait for the document to load.
    async fn navigate(&self, url: &str) -> Result<(), FetchError>;

    /// Extract `document.body.innerText`.
    async fn inner_text(&self) -> Result<String, FetchError>;

    /// Evaluate a JavaScript expression and return its JSON value.
    async fn evaluate(&self, script: &str) -> Result<Value, FetchError>;

    /// Whether an element matching the CSS selector is present.
    async fn exists(&self, selector: &str) -> Result<bool, FetchError>;

    /// Fill a form field with the given value.
    async fn fill(&self, selector: &str, value: &str) -> Result<(), FetchError>;

    /// Click the element matching the selector.
    async fn click(&self, selector: &str) -> Result<(), FetchError>;

    /// Screenshot a single element as PNG bytes.
    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, FetchError>;

    /// Block requests matching the given URL patterns (CDP wildcards).
    async fn set_blocked_urls(&self, patterns: &[String]) -> Result<(), FetchError>;

    /// The page's current URL.
    async fn current_url(&self) -> Result<String, FetchError>;

    /// Close the page and release its resources.
    async fn close(&self) -> Result<(), FetchError>;
}

/// Hands out pages, hiding whether they come from a shared browser or an
/// isolated proxied instance.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Open a fresh page. `proxy` routes the page's traffic through an
    /// isolated browser started with `--proxy-server`.
    async fn open_page(&self, proxy: Option<&str>) -> Result<Arc<dyn PageClient>, FetchError>;

    /// Shut down every browser this engine started.
    async fn close(&self);
}

/// A mock page for testing. Records all calls and returns configurable
/// content.
pub struct MockPageClient {
    /// Current URL (set by navigate).
    pub current_url: Mutex<String>,
    /// Fallback text returned by inner_text().
    pub text_content: Mutex<String>,
    /// Texts popped by successive inner_text() calls before the fallback.
    pub text_queue: Mutex<VecDeque<String>>,
    /// Per-URL text consulted after navigation.
    pub text_by_url: Mutex<HashMap<String, String>>,
    /// JavaScript results keyed by script.
    pub js_results: Mutex<HashMap<String, Value>>,
    /// Selectors exists() reports as present.
    pub selectors_present: Mutex<HashSet<String>>,
    /// Screenshot bytes for screenshot_element().
    pub screenshot_bytes: Mutex<Vec<u8>>,
    /// Record of all method calls for assertion: (method, args).
    pub call_log: Mutex<Vec<(String, Vec<String>)>>,
    /// If set, navigate will return this error.
    pub navigate_error: Mutex<Option<FetchError>>,
    /// If set, the next inner_text will return this error.
    pub text_error: Mutex<Option<FetchError>>,
    /// Whether the page is "closed".
    pub closed: Mutex<bool>,
}

impl Default for MockPageClient {
    fn default() -> Self {
        Self {
            current_url: Mutex::new("about:blank".to_string()),
            text_content: Mutex::new(String::new()),
            text_queue: Mutex::new(VecDeque::new()),
            text_by_url: Mutex::new(HashMap::new()),
            js_results: Mutex::new(HashMap::new()),
            selectors_present: Mutex::new(HashSet::new()),
            screenshot_bytes: Mutex::new(vec![0x89, 0x50, 0x4E, 0x47]), // PNG magic bytes
            call_log: Mutex::new(Vec::new()),
            navigate_error: Mutex::new(None),
            text_error: Mutex::new(None),
            closed: Mutex::new(false),
        }
    }
}

impl MockPageClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback text returned by inner_text().
    pub fn set_text(&self, text: impl Into<String>) {
        *self.text_content.lock().unwrap() = text.into();
    }

    /// Queue a text returned by the next inner_text() call, ahead of the
    /// fallback. Useful for challenge pages that clear after solving.
    pub fn queue_text(&self, text: impl Into<String>) {
        self.text_queue.lock().unwrap().push_back(text.into());
    }

    /// Set the text inner_text() returns after navigating to `url`.
    pub fn set_text_for(&self, url: impl Into<String>, text: impl Into<String>) {
        self.text_by_url.lock().unwrap().insert(url.into(), text.into());
    }

    /// Add a JavaScript result for a given script.
    pub fn add_js_result(&self, script: impl Into<String>, result: Value) {
        self.js_results.lock().unwrap().insert(script.into(), result);
    }

    /// Mark a selector as present for exists().
    pub fn set_selector_present(&self, selector: impl Into<String>) {
        self.selectors_present.lock().unwrap().insert(selector.into());
    }

    /// Set the bytes returned by screenshot_element().
    pub fn set_screenshot(&self, bytes: Vec<u8>) {
        *self.screenshot_bytes.lock().unwrap() = bytes;
    }

    /// Set an error that navigate() will return.
    pub fn set_navigate_error(&self, err: FetchError) {
        *self.navigate_error.lock().unwrap() = Some(err);
    }

    /// Set an error that the next inner_text() will return.
    pub fn set_text_error(&self, err: FetchError) {
        *self.text_error.lock().unwrap() = Some(err);
    }

    fn log_call(&self, method: &str, args: Vec<String>) {
        self.call_log
            .lock()
            .unwrap()
            .push((method.to_string(), args));
    }

    /// Get the number of calls to a given method.
    pub fn call_count(&self, method: &str) -> usize {
        self.call_log
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }

    /// Get all recorded calls.
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.call_log.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageClient for MockPageClient {
    async fn navigate(&self, url: &str) -> Result<(), FetchError> {
        self.log_call("navigate", vec![url.to_string()]);
        if let Some(err) = self.navigate_error.lock().unwrap().take() {
            return Err(err);
        }
        *self.current_url.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn inner_text(&self) -> Result<String, FetchError> {
        self.log_call("inner_text", vec![]);
        if let Some(err) = self.text_error.lock().unwrap().take() {
            return Err(err);
        }
        if let Some(text) = self.text_queue.lock().unwrap().pop_front() {
            return Ok(text);
        }
        let url = self.current_url.lock().unwrap().clone();
        if let Some(text) = self.text_by_url.lock().unwrap().get(&url) {
            return Ok(text.clone());
        }
        Ok(self.text_content.lock().unwrap().clone())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, FetchError> {
        self.log_call("evaluate", vec![script.to_string()]);
        let results = self.js_results.lock().unwrap();
        match results.get(script) {
            Some(val) => Ok(val.clone()),
            None => Ok(Value::Null),
        }
    }

    async fn exists(&self, selector: &str) -> Result<bool, FetchError> {
        self.log_call("exists", vec![selector.to_string()]);
        Ok(self.selectors_present.lock().unwrap().contains(selector))
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), FetchError> {
        self.log_call("fill", vec![selector.to_string(), value.to_string()]);
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), FetchError> {
        self.log_call("click", vec![selector.to_string()]);
        Ok(())
    }

    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, FetchError> {
        self.log_call("screenshot_element", vec![selector.to_string()]);
        Ok(self.screenshot_bytes.lock().unwrap().clone())
    }

    async fn set_blocked_urls(&self, patterns: &[String]) -> Result<(), FetchError> {
        self.log_call("set_blocked_urls", patterns.to_vec());
        Ok(())
    }

    async fn current_url(&self) -> Result<String, FetchError> {
        self.log_call("current_url", vec![]);
        Ok(self.current_url.lock().unwrap().clone())
    }

    async fn close(&self) -> Result<(), FetchError> {
        self.log_call("close", vec![]);
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}

/// A mock engine for testing. Opened pages are retained so tests can assert
/// on their call logs and closed flags after the fetch finishes.
pub struct MockBrowserEngine {
    /// Every page handed out, in open order.
    pub pages: Mutex<Vec<Arc<MockPageClient>>>,
    /// Pages to hand out before falling back to fresh ones.
    prepared: Mutex<VecDeque<Arc<MockPageClient>>>,
    /// Fallback inner_text() content for fresh pages.
    pub default_text: Mutex<String>,
    /// Per-URL content copied into every fresh page.
    pub text_by_url: Mutex<HashMap<String, String>>,
    /// If set, the next open_page will return this error.
    pub open_error: Mutex<Option<FetchError>>,
    /// The proxy argument of every open_page call.
    pub proxies_seen: Mutex<Vec<Option<String>>>,
    /// Whether close() was called.
    pub closed: Mutex<bool>,
}

impl Default for MockBrowserEngine {
    fn default() -> Self {
        Self {
            pages: Mutex::new(Vec::new()),
            prepared: Mutex::new(VecDeque::new()),
            default_text: Mutex::new(String::new()),
            text_by_url: Mutex::new(HashMap::new()),
            open_error: Mutex::new(None),
            proxies_seen: Mutex::new(Vec::new()),
            closed: Mutex::new(false),
        }
    }
}

impl MockBrowserEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fallback text every fresh page returns.
    pub fn set_default_text(&self, text: impl Into<String>) {
        *self.default_text.lock().unwrap() = text.into();
    }

    /// Set the text fresh pages return after navigating to `url`.
    pub fn set_text_for(&self, url: impl Into<String>, text: impl Into<String>) {
        self.text_by_url.lock().unwrap().insert(url.into(), text.into());
    }

    /// Queue a specific page for the next open_page call.
    pub fn prepare_page(&self, page: Arc<MockPageClient>) {
        self.prepared.lock().unwrap().push_back(page);
    }

    /// Set an error that the next open_page will return.
    pub fn set_open_error(&self, err: FetchError) {
        *self.open_error.lock().unwrap() = Some(err);
    }

    /// Number of pages opened so far.
    pub fn opened(&self) -> usize {
        self.pages.lock().unwrap().len()
    }
}

#[async_trait]
impl BrowserEngine for MockBrowserEngine {
    async fn open_page(&self, proxy: Option<&str>) -> Result<Arc<dyn PageClient>, FetchError> {
        self.proxies_seen
            .lock()
            .unwrap()
            .push(proxy.map(str::to_string));
        if let Some(err) = self.open_error.lock().unwrap().take() {
            return Err(err);
        }
        let page = self
            .prepared
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                let page = Arc::new(MockPageClient::new());
                page.set_text(self.default_text.lock().unwrap().clone());
                *page.text_by_url.lock().unwrap() = self.text_by_url.lock().unwrap().clone();
                page
            });
        self.pages.lock().unwrap().push(Arc::clone(&page));
        Ok(page)
    }

    async fn close(&self) {
        *self.closed.lock().unwrap() = true;
        for page in self.pages.lock().unwrap().iter() {
            *page.closed.lock().unwrap() = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_navigate_sets_url() {
        let page = MockPageClient::new();
        page.navigate("https://example.com/a").await.unwrap();
        assert_eq!(
            page.current_url().await.unwrap(),
            "https://example.com/a"
        );
        assert_eq!(page.call_count("navigate"), 1);
    }

    #[tokio::test]
    async fn mock_navigate_error_is_injected_once() {
        let page = MockPageClient::new();
        page.set_navigate_error(FetchError::Navigation {
            url: "https://example.com/a".into(),
            message: "net::ERR_CONNECTION_RESET".into(),
        });
        assert!(page.navigate("https://example.com/a").await.is_err());
        assert!(page.navigate("https://example.com/a").await.is_ok());
    }

    #[tokio::test]
    async fn mock_inner_text_prefers_queue_then_url_then_fallback() {
        let page = MockPageClient::new();
        page.set_text("fallback text");
        page.set_text_for("https://example.com/a", "per-url text");
        page.queue_text("queued text");

        page.navigate("https://example.com/a").await.unwrap();
        assert_eq!(page.inner_text().await.unwrap(), "queued text");
        assert_eq!(page.inner_text().await.unwrap(), "per-url text");

        page.navigate("https://example.com/other").await.unwrap();
        assert_eq!(page.inner_text().await.unwrap(), "fallback text");
    }

    #[tokio::test]
    async fn mock_exists_reflects_configured_selectors() {
        let page = MockPageClient::new();
        page.set_selector_present(".challenge-image");
        assert!(page.exists(".challenge-image").await.unwrap());
        assert!(!page.exists("iframe").await.unwrap());
    }

    #[tokio::test]
    async fn mock_evaluate_returns_configured_value() {
        let page = MockPageClient::new();
        page.add_js_result("1+1", serde_json::json!(2));
        assert_eq!(page.evaluate("1+1").await.unwrap(), serde_json::json!(2));
        assert_eq!(page.evaluate("unknown()").await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn mock_close_marks_closed() {
        let page = MockPageClient::new();
        assert!(!*page.closed.lock().unwrap());
        page.close().await.unwrap();
        assert!(*page.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn mock_engine_hands_out_pages_and_records_proxies() {
        let engine = MockBrowserEngine::new();
        engine.set_default_text("page body");

        let first = engine.open_page(None).await.unwrap();
        let second = engine.open_page(Some("http://proxy:8080")).await.unwrap();
        assert_eq!(first.inner_text().await.unwrap(), "page body");
        assert_eq!(second.inner_text().await.unwrap(), "page body");

        assert_eq!(engine.opened(), 2);
        let proxies = engine.proxies_seen.lock().unwrap().clone();
        assert_eq!(proxies, vec![None, Some("http://proxy:8080".to_string())]);
    }

    #[tokio::test]
    async fn mock_engine_prepared_page_comes_first() {
        let engine = MockBrowserEngine::new();
        let prepared = Arc::new(MockPageClient::new());
        prepared.set_text("prepared body");
        engine.prepare_page(Arc::clone(&prepared));

        let page = engine.open_page(None).await.unwrap();
        assert_eq!(page.inner_text().await.unwrap(), "prepared body");
        assert_eq!(prepared.call_count("inner_text"), 1);
    }

    #[tokio::test]
    async fn mock_engine_close_closes_open_pages() {
        let engine = MockBrowserEngine::new();
        let page = engine.open_page(None).await.unwrap();
        page.navigate("https://example.com/a").await.unwrap();

        engine.close().await;
        assert!(*engine.closed.lock().unwrap());
        let pages = engine.pages.lock().unwrap();
        assert!(*pages[0].closed.lock().unwrap());
    }
}
