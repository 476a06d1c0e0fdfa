//! Anti-bot challenge handling for the browser fetch path.
//!
//! A challenge page is detected by content signature, classified by probing
//! the DOM, and handed to a type-specific solver: interactive widgets and
//! image puzzles go to a third-party CAPTCHA service, generic wait pages get
//! synthetic mouse/scroll/timing interaction. Solve failures are reported as
//! `ChallengeUnsolvable` so the caller can rotate the egress proxy and retry.

use crate::error::FetchError;
use crate::fetch::page::PageClient;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::Rng;
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Content signatures of anti-bot interstitials, matched case-insensitively
/// against the head of the extracted text.
const CHALLENGE_SIGNATURES: &[&str] = &[
    "checking if the site connection is secure",
    "verify you are human",
    "verifying you are human",
    "enable javascript and cookies to continue",
    "checking your browser before accessing",
    "detected unusual traffic",
    "systems have detected unusual",
    "ddos protection by",
    "performance & security by cloudflare",
    "attention required! | cloudflare",
];

/// Interstitials are short; signatures past this point are article prose.
const SIGNATURE_WINDOW_CHARS: usize = 1200;

/// DOM marker of an interactive widget challenge.
const WIDGET_FRAME_SELECTOR: &str = "iframe[src*='challenges.cloudflare.com']";

/// DOM marker of an image puzzle challenge.
const IMAGE_SELECTOR: &str = ".challenge-image";

/// Reads the widget sitekey off the page.
const SITEKEY_JS: &str = "document.querySelector('[data-sitekey]')?.dataset.sitekey";

/// Pause between a submitted solution and the content re-extract.
const SOLVE_SETTLE: Duration = Duration::from_millis(1000);

/// Whether extracted text looks like a challenge page rather than content.
pub fn is_challenge_page(text: &str) -> bool {
    let head: String = text
        .chars()
        .take(SIGNATURE_WINDOW_CHARS)
        .collect::<String>()
        .to_lowercase();
    CHALLENGE_SIGNATURES.iter().any(|sig| head.contains(sig))
}

/// The challenge types the pipeline can tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    /// Interactive widget (turnstile-style iframe with a sitekey).
    Widget,
    /// Image puzzle with a text answer.
    ImagePuzzle,
    /// No solvable element; waits for a background browser check.
    GenericWait,
}

impl ChallengeKind {
    pub fn label(&self) -> &'static str {
        match self {
            ChallengeKind::Widget => "interactive widget",
            ChallengeKind::ImagePuzzle => "image puzzle",
            ChallengeKind::GenericWait => "generic wait",
        }
    }
}

/// Classify a detected challenge by probing the page DOM.
///
/// Probe failures fall back to `GenericWait`: the simulation path works on
/// any page and never needs a solver.
pub async fn classify(page: &dyn PageClient) -> ChallengeKind {
    match page.exists(WIDGET_FRAME_SELECTOR).await {
        Ok(true) => return ChallengeKind::Widget,
        Ok(false) => {}
        Err(err) => {
            debug!(error = %err, "widget probe failed, treating challenge as generic");
            return ChallengeKind::GenericWait;
        }
    }
    match page.exists(IMAGE_SELECTOR).await {
        Ok(true) => ChallengeKind::ImagePuzzle,
        _ => ChallengeKind::GenericWait,
    }
}

/// A third-party CAPTCHA solving service.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    /// Solve an interactive widget; returns the response token to inject.
    async fn solve_widget(&self, site_key: &str, page_url: &str) -> Result<String, FetchError>;

    /// Solve an image puzzle from a PNG screenshot; returns the answer text.
    async fn solve_image(&self, image_png: &[u8]) -> Result<String, FetchError>;
}

const SOLVER_BASE_URL: &str = "https://2captcha.com";
const SOLVER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SOLVER_POLL_INTERVAL: Duration = Duration::from_secs(5);
const SOLVER_POLL_ATTEMPTS: u32 = 24;

#[derive(Debug, Deserialize)]
struct SolverResponse {
    status: i64,
    request: String,
}

/// CAPTCHA service client speaking the 2captcha submit/poll protocol.
pub struct HttpCaptchaSolver {
    client: reqwest::Client,
    api_key: String,
}

impl HttpCaptchaSolver {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
        }
    }

    /// Submit a task; returns the service-side task id.
    async fn submit(&self, form: &[(&str, &str)]) -> Result<String, FetchError> {
        let url = format!("{SOLVER_BASE_URL}/in.php");
        let response = self
            .client
            .post(&url)
            .form(form)
            .timeout(SOLVER_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|err| FetchError::Http {
                url: url.clone(),
                message: err.to_string(),
            })?;
        let body: SolverResponse =
            response.json().await.map_err(|err| FetchError::Http {
                url: url.clone(),
                message: format!("solver response malformed: {err}"),
            })?;
        if body.status != 1 {
            return Err(FetchError::Http {
                url,
                message: format!("solver rejected task: {}", body.request),
            });
        }
        Ok(body.request)
    }

    /// Poll a submitted task until the solution is ready.
    async fn poll(&self, task_id: &str) -> Result<String, FetchError> {
        let url = format!("{SOLVER_BASE_URL}/res.php");
        for _ in 0..SOLVER_POLL_ATTEMPTS {
            sleep(SOLVER_POLL_INTERVAL).await;
            let response = self
                .client
                .get(&url)
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", task_id),
                    ("json", "1"),
                ])
                .timeout(SOLVER_REQUEST_TIMEOUT)
                .send()
                .await
                .map_err(|err| FetchError::Http {
                    url: url.clone(),
                    message: err.to_string(),
                })?;
            let body: SolverResponse =
                response.json().await.map_err(|err| FetchError::Http {
                    url: url.clone(),
                    message: format!("solver response malformed: {err}"),
                })?;
            if body.status == 1 {
                return Ok(body.request);
            }
            if body.request != "CAPCHA_NOT_READY" {
                return Err(FetchError::Http {
                    url,
                    message: format!("solver error: {}", body.request),
                });
            }
        }
        Err(FetchError::Http {
            url,
            message: "solver did not finish in time".to_string(),
        })
    }
}

#[async_trait]
impl CaptchaSolver for HttpCaptchaSolver {
    async fn solve_widget(&self, site_key: &str, page_url: &str) -> Result<String, FetchError> {
        let task_id = self
            .submit(&[
                ("key", self.api_key.as_str()),
                ("method", "turnstile"),
                ("sitekey", site_key),
                ("pageurl", page_url),
                ("json", "1"),
            ])
            .await?;
        self.poll(&task_id).await
    }

    async fn solve_image(&self, image_png: &[u8]) -> Result<String, FetchError> {
        let encoded = BASE64.encode(image_png);
        let task_id = self
            .submit(&[
                ("key", self.api_key.as_str()),
                ("method", "base64"),
                ("body", encoded.as_str()),
                ("json", "1"),
            ])
            .await?;
        self.poll(&task_id).await
    }
}

/// A mock solver for testing. Records calls and returns queued solutions.
pub struct MockCaptchaSolver {
    tokens: Mutex<Vec<String>>,
    answers: Mutex<Vec<String>>,
    fail: Mutex<bool>,
    /// Record of calls: (method, argument summary).
    pub call_log: Mutex<Vec<(String, String)>>,
}

impl Default for MockCaptchaSolver {
    fn default() -> Self {
        Self {
            tokens: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
            fail: Mutex::new(false),
            call_log: Mutex::new(Vec::new()),
        }
    }
}

impl MockCaptchaSolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a token returned by the next solve_widget call.
    pub fn queue_token(&self, token: &str) {
        self.tokens.lock().unwrap().push(token.to_string());
    }

    /// Queue an answer returned by the next solve_image call.
    pub fn queue_answer(&self, answer: &str) {
        self.answers.lock().unwrap().push(answer.to_string());
    }

    /// Make every solve call fail.
    pub fn set_fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
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
}

#[async_trait]
impl CaptchaSolver for MockCaptchaSolver {
    async fn solve_widget(&self, site_key: &str, _page_url: &str) -> Result<String, FetchError> {
        self.call_log
            .lock()
            .unwrap()
            .push(("widget".to_string(), site_key.to_string()));
        if *self.fail.lock().unwrap() {
            return Err(FetchError::Http {
                url: "mock://solver".to_string(),
                message: "mock solver failure".to_string(),
            });
        }
        let mut tokens = self.tokens.lock().unwrap();
        if tokens.is_empty() {
            return Err(FetchError::Http {
                url: "mock://solver".to_string(),
                message: "no queued token".to_string(),
            });
        }
        Ok(tokens.remove(0))
    }

    async fn solve_image(&self, image_png: &[u8]) -> Result<String, FetchError> {
        self.call_log
            .lock()
            .unwrap()
            .push(("image".to_string(), format!("{} bytes", image_png.len())));
        if *self.fail.lock().unwrap() {
            return Err(FetchError::Http {
                url: "mock://solver".to_string(),
                message: "mock solver failure".to_string(),
            });
        }
        let mut answers = self.answers.lock().unwrap();
        if answers.is_empty() {
            return Err(FetchError::Http {
                url: "mock://solver".to_string(),
                message: "no queued answer".to_string(),
            });
        }
        Ok(answers.remove(0))
    }
}

/// Runs the detect → classify → solve → re-extract sequence on a page whose
/// first extract hit a challenge signature.
pub struct ChallengeHandler {
    solver: Option<Arc<dyn CaptchaSolver>>,
}

impl ChallengeHandler {
    /// Without a solver, widget and image challenges are abandoned
    /// immediately; generic waits are still attempted via simulation.
    pub fn new(solver: Option<Arc<dyn CaptchaSolver>>) -> Self {
        Self { solver }
    }

    /// Try to get past the challenge. Returns the page text once it clears.
    pub async fn resolve(
        &self,
        page: &dyn PageClient,
        url: &str,
    ) -> Result<String, FetchError> {
        let kind = classify(page).await;
        debug!(url, kind = kind.label(), "challenge detected");

        match kind {
            ChallengeKind::Widget => self.solve_widget(page, url).await?,
            ChallengeKind::ImagePuzzle => self.solve_image(page, url).await?,
            ChallengeKind::GenericWait => simulate_human(page).await,
        }
        sleep(SOLVE_SETTLE).await;

        let text = page.inner_text().await?;
        if is_challenge_page(&text) {
            return Err(unsolvable(url, kind));
        }
        Ok(text)
    }

    async fn solve_widget(&self, page: &dyn PageClient, url: &str) -> Result<(), FetchError> {
        let Some(solver) = &self.solver else {
            warn!(url, "widget challenge but no CAPTCHA solver configured");
            return Err(unsolvable(url, ChallengeKind::Widget));
        };
        let site_key = page
            .evaluate(SITEKEY_JS)
            .await?
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| unsolvable(url, ChallengeKind::Widget))?;
        let token = solver.solve_widget(&site_key, url).await.map_err(|err| {
            warn!(url, error = %err, "widget solve failed");
            unsolvable(url, ChallengeKind::Widget)
        })?;

        // Serialize the token to a JS string literal so it injects cleanly.
        let literal = serde_json::Value::String(token).to_string();
        let script = format!(
            "document.querySelector('input[name=cf-turnstile-response]').value = {literal}; \
             document.querySelector('form').submit();"
        );
        page.evaluate(&script).await?;
        Ok(())
    }

    async fn solve_image(&self, page: &dyn PageClient, url: &str) -> Result<(), FetchError> {
        let Some(solver) = &self.solver else {
            warn!(url, "image challenge but no CAPTCHA solver configured");
            return Err(unsolvable(url, ChallengeKind::ImagePuzzle));
        };
        let image = page.screenshot_element(IMAGE_SELECTOR).await?;
        let answer = solver.solve_image(&image).await.map_err(|err| {
            warn!(url, error = %err, "image solve failed");
            unsolvable(url, ChallengeKind::ImagePuzzle)
        })?;
        page.fill("input[name=cf_captcha_answer]", &answer).await?;
        page.click("button[type=submit]").await?;
        Ok(())
    }
}

fn unsolvable(url: &str, kind: ChallengeKind) -> FetchError {
    FetchError::ChallengeUnsolvable {
        url: url.to_string(),
        kind: kind.label().to_string(),
    }
}

/// Synthetic mouse movement, scrolling, and timing against the page.
///
/// Failures are logged and swallowed: simulation is best-effort and the
/// re-extract afterwards decides whether the challenge cleared.
pub(crate) async fn simulate_human(page: &dyn PageClient) {
    // Sample the whole interaction up front; ThreadRng cannot be held
    // across await points.
    let (moves, scrolls, click) = {
        let mut rng = rand::thread_rng();
        let moves: Vec<(u32, u32, u64)> = (0..rng.gen_range(3..=5))
            .map(|_| {
                (
                    rng.gen_range(0..800),
                    rng.gen_range(0..600),
                    rng.gen_range(10..50),
                )
            })
            .collect();
        let scrolls: Vec<(i32, u64)> = (0..rng.gen_range(1..=3))
            .map(|_| {
                let delta = rng.gen_range(300..800);
                let delta = if rng.gen_bool(0.5) { delta } else { -delta };
                (delta, rng.gen_range(100..200))
            })
            .collect();
        let click = rng
            .gen_bool(0.3)
            .then(|| (rng.gen_range(0..800), rng.gen_range(0..600)));
        (moves, scrolls, click)
    };

    for (x, y, pause_ms) in moves {
        let script = format!(
            "window.dispatchEvent(new MouseEvent('mousemove', \
             {{bubbles: true, clientX: {x}, clientY: {y}}}))"
        );
        if let Err(err) = page.evaluate(&script).await {
            debug!(error = %err, "mouse simulation failed");
        }
        sleep(Duration::from_millis(pause_ms)).await;
    }

    for (delta, pause_ms) in scrolls {
        if let Err(err) = page.evaluate(&format!("window.scrollBy(0, {delta})")).await {
            debug!(error = %err, "scroll simulation failed");
        }
        sleep(Duration::from_millis(pause_ms)).await;
    }

    if let Some((x, y)) = click {
        let script = format!(
            "(() => {{ const el = document.elementFromPoint({x}, {y}); \
             if (el) el.dispatchEvent(new MouseEvent('click', \
             {{bubbles: true, clientX: {x}, clientY: {y}}})); }})()"
        );
        if let Err(err) = page.evaluate(&script).await {
            debug!(error = %err, "click simulation failed");
        }
    }
}
