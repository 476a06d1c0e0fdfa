//! Chromium-backed implementation of the page and engine traits.
//!
//! A single shared browser serves un-proxied fetches and is launched lazily
//! on first use. Proxied fetches each get an isolated browser started with
//! `--proxy-server`, since Chromium cannot change its proxy per page. All
//! launched browsers are torn down by `close()`.

use crate::config::CrawlerConfig;
use crate::error::FetchError;
use crate::fetch::page::{BrowserEngine, PageClient};
use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, SetBlockedUrLsParams};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use futures::StreamExt;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

const INNER_TEXT_JS: &str = "document.body ? document.body.innerText : ''";

fn cdp_err(context: &str, err: impl std::fmt::Display) -> FetchError {
    FetchError::Session {
        message: format!("{context}: {err}"),
    }
}

/// A launched browser process plus the task draining its event stream.
struct BrowserHandle {
    browser: chromiumoxide::Browser,
    handler_task: JoinHandle<()>,
}

impl BrowserHandle {
    async fn shutdown(mut self) {
        if let Err(err) = self.browser.close().await {
            debug!(error = %err, "browser close failed");
        }
        self.handler_task.abort();
    }
}

/// Browser engine backed by headless Chromium.
pub struct ChromiumEngine {
    headless: bool,
    chrome_path: Option<String>,
    viewport_width: u32,
    viewport_height: u32,
    shared: Mutex<Option<BrowserHandle>>,
    proxied: Mutex<Vec<BrowserHandle>>,
}

impl ChromiumEngine {
    pub fn new(config: &CrawlerConfig) -> Self {
        Self {
            headless: config.headless,
            chrome_path: config.chrome_path.clone(),
            viewport_width: config.viewport_width,
            viewport_height: config.viewport_height,
            shared: Mutex::new(None),
            proxied: Mutex::new(Vec::new()),
        }
    }

    fn browser_config(
        &self,
        proxy: Option<&str>,
    ) -> Result<chromiumoxide::BrowserConfig, FetchError> {
        let chrome = match &self.chrome_path {
            Some(path) => PathBuf::from(path),
            None => find_chrome_binary().ok_or_else(|| FetchError::Session {
                message: "no Chrome/Chromium binary found; set crawler.chrome_path".to_string(),
            })?,
        };

        // Unique profile directory so parallel instances do not fight over
        // the singleton lock.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let profile = std::env::temp_dir().join(format!(
            "deepscout-profile-{}-{nanos}",
            std::process::id()
        ));

        let mut builder = chromiumoxide::BrowserConfig::builder()
            .chrome_executable(chrome)
            .window_size(self.viewport_width, self.viewport_height)
            .user_data_dir(profile)
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--disable-blink-features=AutomationControlled");
        if self.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }
        if let Some(proxy) = proxy {
            builder = builder.arg(format!("--proxy-server={proxy}"));
        }
        builder
            .build()
            .map_err(|message| FetchError::Session { message })
    }

    async fn launch(&self, proxy: Option<&str>) -> Result<BrowserHandle, FetchError> {
        let config = self.browser_config(proxy)?;
        let (browser, mut handler) = chromiumoxide::Browser::launch(config)
            .await
            .map_err(|err| cdp_err("browser launch failed", err))?;
        let handler_task = tokio::spawn(async move {
            while let Some(_event) = handler.next().await {}
        });
        debug!(proxied = proxy.is_some(), "launched chromium");
        Ok(BrowserHandle {
            browser,
            handler_task,
        })
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn open_page(&self, proxy: Option<&str>) -> Result<Arc<dyn PageClient>, FetchError> {
        let page = match proxy {
            None => {
                let mut guard = self.shared.lock().await;
                if guard.is_none() {
                    *guard = Some(self.launch(None).await?);
                }
                let handle = guard.as_ref().ok_or_else(|| FetchError::Session {
                    message: "shared browser unavailable".to_string(),
                })?;
                match handle.browser.new_page("about:blank").await {
                    Ok(page) => page,
                    Err(err) => {
                        // The browser likely died; drop the handle so the
                        // next call relaunches.
                        if let Some(dead) = guard.take() {
                            dead.handler_task.abort();
                        }
                        return Err(cdp_err("new page failed", err));
                    }
                }
            }
            Some(proxy) => {
                let handle = self.launch(Some(proxy)).await?;
                let page = handle
                    .browser
                    .new_page("about:blank")
                    .await
                    .map_err(|err| cdp_err("new proxied page failed", err))?;
                self.proxied.lock().await.push(handle);
                page
            }
        };
        Ok(Arc::new(ChromiumPage { page }))
    }

    async fn close(&self) {
        if let Some(handle) = self.shared.lock().await.take() {
            handle.shutdown().await;
        }
        let proxied: Vec<BrowserHandle> = self.proxied.lock().await.drain(..).collect();
        for handle in proxied {
            handle.shutdown().await;
        }
    }
}

/// One chromiumoxide page.
pub struct ChromiumPage {
    page: chromiumoxide::Page,
}

#[async_trait]
impl PageClient for ChromiumPage {
    async fn navigate(&self, url: &str) -> Result<(), FetchError> {
        self.page
            .goto(url)
            .await
            .map_err(|err| FetchError::Navigation {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        Ok(())
    }

    async fn inner_text(&self) -> Result<String, FetchError> {
        let result = self
            .page
            .evaluate(INNER_TEXT_JS)
            .await
            .map_err(|err| cdp_err("text extraction failed", err))?;
        let text = result.value().and_then(Value::as_str).unwrap_or_default();
        Ok(text.to_string())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, FetchError> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|err| cdp_err("script evaluation failed", err))?;
        Ok(result.value().cloned().unwrap_or(Value::Null))
    }

    async fn exists(&self, selector: &str) -> Result<bool, FetchError> {
        Ok(self.page.find_element(selector).await.is_ok())
    }

    async fn fill(&self, selector: &str, value: &str) -> Result<(), FetchError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|err| cdp_err("fill target not found", err))?;
        element
            .click()
            .await
            .map_err(|err| cdp_err("fill focus failed", err))?;
        element
            .type_str(value)
            .await
            .map_err(|err| cdp_err("typing failed", err))?;
        Ok(())
    }

    async fn click(&self, selector: &str) -> Result<(), FetchError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|err| cdp_err("click target not found", err))?;
        element
            .click()
            .await
            .map_err(|err| cdp_err("click failed", err))?;
        Ok(())
    }

    async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, FetchError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|err| cdp_err("screenshot target not found", err))?;
        element
            .screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(|err| cdp_err("screenshot failed", err))
    }

    async fn set_blocked_urls(&self, patterns: &[String]) -> Result<(), FetchError> {
        self.page
            .execute(EnableParams::default())
            .await
            .map_err(|err| cdp_err("network enable failed", err))?;
        self.page
            .execute(SetBlockedUrLsParams::new(patterns.to_vec()))
            .await
            .map_err(|err| cdp_err("request blocking failed", err))?;
        Ok(())
    }

    async fn current_url(&self) -> Result<String, FetchError> {
        let url = self
            .page
            .url()
            .await
            .map_err(|err| cdp_err("url query failed", err))?;
        Ok(url.unwrap_or_else(|| "about:blank".to_string()))
    }

    async fn close(&self) -> Result<(), FetchError> {
        self.page
            .clone()
            .close()
            .await
            .map_err(|err| cdp_err("page close failed", err))
    }
}

fn find_chrome_binary() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    let candidates = [
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        "/Applications/Chromium.app/Contents/MacOS/Chromium",
    ];
    #[cfg(target_os = "linux")]
    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/snap/bin/chromium",
    ];
    #[cfg(target_os = "windows")]
    let candidates = [
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    ];
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    let candidates: [&str; 0] = [];

    candidates.iter().map(PathBuf::from).find(|path| path.exists())
}
