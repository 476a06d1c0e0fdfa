//! Source adapters.
//!
//! An adapter knows one place to look for content: it expands a search URL
//! (or plain keywords) into candidate content links, and may handle content
//! fetching itself over plain HTTP. Adapters that do not override `fetch`
//! get their links fetched through the browser path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use crate::config::{CrawlerConfig, SearchConfig};
use crate::error::FetchError;
use crate::links::{extract_links, is_fetchable_url};

/// HTTP attempts per request, matching the per-link attempt budget.
const HTTP_ATTEMPTS: usize = 3;
/// Base delay between HTTP attempts; scaled by the attempt number.
const HTTP_RETRY_DELAY_SECS: u64 = 2;
/// Repositories requested from the code-host search API.
const REPO_SEARCH_LIMIT: usize = 10;

const ADAPTER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

// ── Trait and registry ─────────────────────────────────────────────────────

/// A content source the engine can expand queries against.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Registry key; also recorded on every `CandidateLink` it produces.
    fn name(&self) -> &str;

    /// Expands a search URL or plain keywords into candidate content URLs.
    async fn expand(&self, query: &str) -> Result<Vec<String>, FetchError>;

    /// Direct HTTP fetch for URLs this adapter owns. `None` routes the URL
    /// to the browser path instead.
    async fn fetch(&self, _url: &str) -> Option<Result<String, FetchError>> {
        None
    }
}

/// Flat name-to-adapter lookup table.
#[derive(Default)]
pub struct SourceRegistry {
    adapters: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the standard adapters, sharing one HTTP client.
    pub fn with_defaults(
        crawler: &CrawlerConfig,
        search: &SearchConfig,
    ) -> Result<Self, FetchError> {
        let client = build_http_client(crawler.fetch_timeout_secs, None)?;

        // Sogou serves the Weixin index only to Chinese-locale requests.
        let mut zh_headers = reqwest::header::HeaderMap::new();
        zh_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            reqwest::header::HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        let zh_client = build_http_client(crawler.fetch_timeout_secs, Some(zh_headers))?;

        let mut registry = Self::new();
        registry.register(Arc::new(WebAdapter::new(
            client.clone(),
            search,
            crawler.fetch_timeout_secs,
        )));
        registry.register(Arc::new(ArxivAdapter::new(
            client.clone(),
            crawler.fetch_timeout_secs,
        )));
        registry.register(Arc::new(GithubAdapter::new(client)));
        registry.register(Arc::new(WechatAdapter::new(
            zh_client,
            crawler.fetch_timeout_secs,
        )));
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Resolves adapter names to adapters; unknown names are logged and
    /// dropped.
    pub fn adapters_for(&self, names: &[String]) -> Vec<Arc<dyn SourceAdapter>> {
        names
            .iter()
            .filter_map(|name| {
                let adapter = self.adapters.get(name).cloned();
                if adapter.is_none() {
                    warn!(source = %name, "no adapter registered under this name");
                }
                adapter
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Shared HTTP client with the timeouts and identity the adapters use.
pub fn build_http_client(
    timeout_secs: u64,
    default_headers: Option<reqwest::header::HeaderMap>,
) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .user_agent(ADAPTER_USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5));
    if let Some(headers) = default_headers {
        builder = builder.default_headers(headers);
    }
    builder.build().map_err(|e| FetchError::Session {
        message: format!("failed to build HTTP client: {e}"),
    })
}

/// GET with bounded retries. Rate limits and transport errors back off
/// linearly by attempt number; a non-success final status maps to `Http`.
async fn http_get_text(
    client: &reqwest::Client,
    url: &str,
    timeout_secs: u64,
) -> Result<String, FetchError> {
    let mut last_err = FetchError::EmptyBody {
        url: url.to_string(),
    };
    for attempt in 1..=HTTP_ATTEMPTS {
        match client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response.text().await.map_err(|e| FetchError::Http {
                        url: url.to_string(),
                        message: e.to_string(),
                    });
                }
                if status.as_u16() == 429 {
                    warn!(url = %url, attempt, "rate limited, backing off");
                } else {
                    warn!(url = %url, status = status.as_u16(), attempt, "http error");
                }
                last_err = FetchError::Http {
                    url: url.to_string(),
                    message: format!("status {status}"),
                };
            }
            Err(e) => {
                last_err = if e.is_timeout() {
                    FetchError::Timeout {
                        url: url.to_string(),
                        timeout_secs,
                    }
                } else {
                    FetchError::Http {
                        url: url.to_string(),
                        message: e.to_string(),
                    }
                };
                warn!(url = %url, attempt, error = %e, "request failed");
            }
        }
        if attempt < HTTP_ATTEMPTS {
            tokio::time::sleep(Duration::from_secs(HTTP_RETRY_DELAY_SECS * attempt as u64)).await;
        }
    }
    Err(last_err)
}

/// Pulls search keywords out of a verdict search URL. Plain keywords pass
/// through; URLs yield their `q`/`query` parameter when they carry one.
fn search_terms(input: &str) -> String {
    match Url::parse(input) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url
            .query_pairs()
            .find(|(key, _)| key == "q" || key == "query")
            .map(|(_, value)| value.into_owned())
            .unwrap_or_else(|| input.to_string()),
        _ => input.to_string(),
    }
}

/// Strips HTML down to readable text: drops tags, scripts and styles,
/// decodes common entities, and collapses blank lines.
pub(crate) fn html_to_text(html: &str) -> String {
    let mut text = String::new();
    let mut in_tag = false;
    let mut in_script = false;
    let mut in_style = false;
    let mut tag_name = String::new();
    let mut building_tag = false;

    for ch in html.chars() {
        if ch == '<' {
            in_tag = true;
            building_tag = true;
            tag_name.clear();
            continue;
        }
        if ch == '>' {
            in_tag = false;
            building_tag = false;

            let tag = tag_name.to_lowercase();
            match tag.as_str() {
                "script" => in_script = true,
                "/script" => in_script = false,
                "style" => in_style = true,
                "/style" => in_style = false,
                _ => {}
            }
            if matches!(
                tag.as_str(),
                "p" | "/p" | "br" | "div" | "/div" | "li" | "tr" | "table"
            ) || tag.starts_with('h')
                || tag.starts_with("/h")
            {
                text.push('\n');
            }
            continue;
        }
        if in_tag {
            if building_tag && (ch.is_alphanumeric() || ch == '/') {
                tag_name.push(ch);
            } else {
                building_tag = false;
            }
            continue;
        }
        if in_script || in_style {
            continue;
        }
        text.push(ch);
    }

    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Web adapter ────────────────────────────────────────────────────────────

/// Link fragments that mark navigation, tracking, or account pages rather
/// than content.
const LOW_VALUE_PATTERNS: &[&str] = &[
    "/ads/",
    "/ad/",
    "doubleclick",
    "analytics",
    "tracker",
    "utm_",
    "redirect",
    "login",
    "signup",
    "register",
    "subscribe",
    "newsletter",
    "account",
    "privacy",
    "terms",
    "about-us",
    "contact",
    "faq",
    "cookie",
    "disclaimer",
    "sitemap",
    "facebook.com/sharer",
    "twitter.com/intent",
    "linkedin.com/share",
    "pinterest.com/pin",
    "/tag/",
    "/tags/",
    "/category/",
    "/archive/",
    "/author/",
    "print=",
    "cart",
    "checkout",
    "search?",
    "/search",
    "query=",
];

fn is_low_value(url: &str) -> bool {
    let lower = url.to_lowercase();
    LOW_VALUE_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

/// Unwraps search-engine redirect links (DuckDuckGo's `/l/?uddg=` form)
/// into the destination URL.
fn decode_engine_redirect(url: &str) -> String {
    if let Ok(parsed) = Url::parse(url) {
        let is_ddg = parsed
            .host_str()
            .is_some_and(|host| host.ends_with("duckduckgo.com"));
        if is_ddg && parsed.path().starts_with("/l/") {
            if let Some((_, target)) = parsed.query_pairs().find(|(key, _)| key == "uddg") {
                return target.into_owned();
            }
        }
    }
    url.to_string()
}

/// General web search. With a serper-style API key configured the JSON API
/// answers directly; otherwise engine result pages are fetched and their
/// links extracted. Content fetching stays on the browser path.
pub struct WebAdapter {
    client: reqwest::Client,
    engine: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

impl WebAdapter {
    pub fn new(client: reqwest::Client, search: &SearchConfig, timeout_secs: u64) -> Self {
        let api_key = search
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        if api_key.is_some() {
            debug!("web adapter using the search API");
        }
        Self {
            client,
            engine: search.engine.clone(),
            api_key,
            timeout_secs,
        }
    }

    fn engine_search_url(&self, query: &str) -> String {
        let encoded = urlencoding::encode(query);
        match self.engine.as_str() {
            "bing" => format!("https://www.bing.com/search?q={encoded}"),
            _ => format!("https://html.duckduckgo.com/html/?q={encoded}"),
        }
    }

    async fn expand_result_page(&self, page_url: &str) -> Result<Vec<String>, FetchError> {
        let html = http_get_text(&self.client, page_url, self.timeout_secs).await?;
        Ok(collect_web_links(&html, page_url))
    }

    async fn search_api(&self, query: &str, key: &str) -> Result<Vec<String>, FetchError> {
        let response = self
            .client
            .post("https://google.serper.dev/search")
            .header("X-API-KEY", key)
            .json(&serde_json::json!({ "q": query }))
            .send()
            .await
            .map_err(|e| FetchError::Http {
                url: "https://google.serper.dev/search".to_string(),
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                url: "https://google.serper.dev/search".to_string(),
                message: format!("status {status}"),
            });
        }
        let body: serde_json::Value = response.json().await.map_err(|e| FetchError::Http {
            url: "https://google.serper.dev/search".to_string(),
            message: e.to_string(),
        })?;

        let mut links = Vec::new();
        if let Some(organic) = body.get("organic").and_then(|v| v.as_array()) {
            for item in organic {
                if let Some(link) = item.get("link").and_then(|v| v.as_str()) {
                    if is_fetchable_url(link) && !is_low_value(link) {
                        links.push(link.to_string());
                    }
                }
            }
        }
        Ok(links)
    }
}

/// Extracts content links from a result page: engine redirects unwrapped,
/// navigation noise dropped, order-preserving dedup.
fn collect_web_links(html: &str, page_url: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    extract_links(html, page_url)
        .into_iter()
        .map(|link| decode_engine_redirect(&link))
        .filter(|link| is_fetchable_url(link) && !is_low_value(link) && link != page_url)
        .filter(|link| seen.insert(link.clone()))
        .collect()
}

#[async_trait]
impl SourceAdapter for WebAdapter {
    fn name(&self) -> &str {
        "web"
    }

    async fn expand(&self, query: &str) -> Result<Vec<String>, FetchError> {
        if let Ok(url) = Url::parse(query) {
            if matches!(url.scheme(), "http" | "https") {
                return self.expand_result_page(url.as_str()).await;
            }
        }
        if let Some(key) = self.api_key.clone() {
            return self.search_api(query, &key).await;
        }
        let search_url = self.engine_search_url(query);
        self.expand_result_page(&search_url).await
    }
}

// ── arXiv adapter ──────────────────────────────────────────────────────────

const ARXIV_SEARCH_FORMAT: &str = "https://arxiv.org/search/?query={}&searchtype=all";
/// arXiv sections that are not papers.
const ARXIV_EXCLUDED_SEGMENTS: &[&str] = &["/blog/", "/help/", "/about/", "/login/", "/search/"];

fn is_paper_url(url: &str) -> bool {
    url.contains("arxiv.org")
        && !ARXIV_EXCLUDED_SEGMENTS.iter().any(|seg| url.contains(seg))
        && (url.contains("/abs/") || url.contains("/html/") || url.contains("/pdf/"))
}

/// Rewrites paper PDF / HTML URLs to the abstract page, which serves the
/// same metadata as plain HTML and is far cheaper to fetch.
fn to_abstract_url(url: &str) -> String {
    let rewritten = url.replace("/pdf/", "/abs/").replace("/html/", "/abs/");
    rewritten
        .strip_suffix(".pdf")
        .map(str::to_string)
        .unwrap_or(rewritten)
}

/// Paper archive search. Expansion scrapes the arXiv search page; content
/// is fetched over plain HTTP (no browser needed for abstract pages).
pub struct ArxivAdapter {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl ArxivAdapter {
    pub fn new(client: reqwest::Client, timeout_secs: u64) -> Self {
        Self {
            client,
            timeout_secs,
        }
    }

    async fn expand_search_page(&self, search_url: &str) -> Result<Vec<String>, FetchError> {
        let html = http_get_text(&self.client, search_url, self.timeout_secs).await?;
        Ok(collect_paper_links(&html, search_url))
    }
}

/// Extracts paper links from a search page. When the page markup yields no
/// links, falls back to scanning for bare paper identifiers.
fn collect_paper_links(html: &str, base_url: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let links: Vec<String> = extract_links(html, base_url)
        .into_iter()
        .filter(|link| is_paper_url(link))
        .map(|link| to_abstract_url(&link))
        .filter(|link| seen.insert(link.clone()))
        .collect();
    if !links.is_empty() {
        return links;
    }

    let Ok(id_pattern) = regex::Regex::new(r"\b(\d{4}\.\d{4,5})(v\d+)?\b") else {
        return Vec::new();
    };
    let mut ids = std::collections::HashSet::new();
    id_pattern
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .filter(|id| ids.insert(id.clone()))
        .map(|id| format!("https://arxiv.org/abs/{id}"))
        .collect()
}

#[async_trait]
impl SourceAdapter for ArxivAdapter {
    fn name(&self) -> &str {
        "arxiv"
    }

    async fn expand(&self, query: &str) -> Result<Vec<String>, FetchError> {
        if query.contains("arxiv.org") && Url::parse(query).is_ok() {
            if is_paper_url(query) {
                return Ok(vec![to_abstract_url(query)]);
            }
            if query.contains("/search/") {
                return self.expand_search_page(query).await;
            }
        }
        let term = search_terms(query);
        let search_url = ARXIV_SEARCH_FORMAT.replace("{}", &urlencoding::encode(&term));
        self.expand_search_page(&search_url).await
    }

    async fn fetch(&self, url: &str) -> Option<Result<String, FetchError>> {
        let target = to_abstract_url(url);
        let result = http_get_text(&self.client, &target, self.timeout_secs)
            .await
            .and_then(|html| {
                let text = html_to_text(&html);
                if text.trim().is_empty() {
                    Err(FetchError::EmptyBody { url: target })
                } else {
                    Ok(text)
                }
            });
        Some(result)
    }
}

// ── GitHub adapter ─────────────────────────────────────────────────────────

const GITHUB_API: &str = "https://api.github.com";

/// `github.com/{owner}/{repo}`; deeper paths belong to the browser path.
fn repo_slug(url: &str) -> Option<(String, String)> {
    let parsed = Url::parse(url).ok()?;
    if parsed.host_str()? != "github.com" {
        return None;
    }
    let mut segments = parsed.path_segments()?.filter(|s| !s.is_empty());
    let owner = segments.next()?.to_string();
    let repo = segments.next()?.to_string();
    if segments.next().is_some() {
        return None;
    }
    Some((owner, repo))
}

/// Code-host search via the REST API, ordered by stars. Repository content
/// comes from the readme, fetched raw.
pub struct GithubAdapter {
    client: reqwest::Client,
    token: Option<String>,
}

impl GithubAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            token: std::env::var("GITHUB_TOKEN").ok(),
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }

    async fn fetch_readme(&self, owner: &str, repo: &str) -> Result<String, FetchError> {
        let api_url = format!("{GITHUB_API}/repos/{owner}/{repo}/readme");
        let response = self
            .authorize(
                self.client
                    .get(&api_url)
                    .header("Accept", "application/vnd.github.raw"),
            )
            .send()
            .await
            .map_err(|e| FetchError::Http {
                url: api_url.clone(),
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                url: api_url,
                message: format!("status {status}"),
            });
        }
        let body = response.text().await.map_err(|e| FetchError::Http {
            url: api_url.clone(),
            message: e.to_string(),
        })?;
        if body.trim().is_empty() {
            return Err(FetchError::EmptyBody { url: api_url });
        }
        Ok(body)
    }
}

#[async_trait]
impl SourceAdapter for GithubAdapter {
    fn name(&self) -> &str {
        "github"
    }

    async fn expand(&self, query: &str) -> Result<Vec<String>, FetchError> {
        let term = search_terms(query);
        let api_url = format!(
            "{GITHUB_API}/search/repositories?q={}&sort=stars&order=desc&per_page={REPO_SEARCH_LIMIT}",
            urlencoding::encode(&term)
        );
        debug!(url = %api_url, "searching repositories");

        let response = self
            .authorize(
                self.client
                    .get(&api_url)
                    .header("Accept", "application/vnd.github+json"),
            )
            .send()
            .await
            .map_err(|e| FetchError::Http {
                url: api_url.clone(),
                message: e.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                url: api_url,
                message: format!("status {status}"),
            });
        }
        let body: serde_json::Value = response.json().await.map_err(|e| FetchError::Http {
            url: api_url.clone(),
            message: e.to_string(),
        })?;

        let links = body
            .get("items")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("html_url").and_then(|v| v.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(links)
    }

    async fn fetch(&self, url: &str) -> Option<Result<String, FetchError>> {
        let (owner, repo) = repo_slug(url)?;
        Some(self.fetch_readme(&owner, &repo).await)
    }
}

// ── WeChat adapter ─────────────────────────────────────────────────────────

const SOGOU_SEARCH_FORMAT: &str = "https://weixin.sogou.com/weixin?type=2&query={}";

/// Social articles via the Sogou Weixin index. Only direct article links
/// survive; Sogou's own redirect links die under URL normalization, and the
/// article pages need the browser path anyway.
pub struct WechatAdapter {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl WechatAdapter {
    pub fn new(client: reqwest::Client, timeout_secs: u64) -> Self {
        Self {
            client,
            timeout_secs,
        }
    }
}

fn collect_article_links(html: &str, base_url: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    extract_links(html, base_url)
        .into_iter()
        .filter(|link| link.contains("mp.weixin.qq.com/s"))
        .filter(|link| seen.insert(link.clone()))
        .collect()
}

#[async_trait]
impl SourceAdapter for WechatAdapter {
    fn name(&self) -> &str {
        "wechat"
    }

    async fn expand(&self, query: &str) -> Result<Vec<String>, FetchError> {
        let term = search_terms(query);
        let search_url = SOGOU_SEARCH_FORMAT.replace("{}", &urlencoding::encode(&term));
        let html = http_get_text(&self.client, &search_url, self.timeout_secs).await?;
        Ok(collect_article_links(&html, &search_url))
    }
}

// ── Mock adapter ───────────────────────────────────────────────────────────

/// Scriptable adapter for tests: queued expansions and canned fetch bodies.
pub struct MockSourceAdapter {
    name: String,
    expansions: Mutex<Vec<Vec<String>>>,
    content: Mutex<HashMap<String, String>>,
    queries: Mutex<Vec<String>>,
}

impl MockSourceAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            expansions: Mutex::new(Vec::new()),
            content: Mutex::new(HashMap::new()),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Queues one expansion result; consumed in FIFO order. Once the queue
    /// is empty, `expand` returns no links.
    pub fn queue_links(&self, links: &[&str]) {
        self.expansions
            .lock()
            .unwrap()
            .push(links.iter().map(|s| s.to_string()).collect());
    }

    /// Makes `fetch` answer `url` with `text` over the HTTP path.
    pub fn set_content(&self, url: &str, text: &str) {
        self.content
            .lock()
            .unwrap()
            .insert(url.to_string(), text.to_string());
    }

    /// Every query `expand` has received, in order.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceAdapter for MockSourceAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn expand(&self, query: &str) -> Result<Vec<String>, FetchError> {
        self.queries.lock().unwrap().push(query.to_string());
        let mut expansions = self.expansions.lock().unwrap();
        if expansions.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(expansions.remove(0))
        }
    }

    async fn fetch(&self, url: &str) -> Option<Result<String, FetchError>> {
        self.content
            .lock()
            .unwrap()
            .get(url)
            .map(|text| Ok(text.clone()))
    }
}
