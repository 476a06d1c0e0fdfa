//! Configuration system for deepscout.
//!
//! Uses `figment` for layered configuration: defaults -> config file ->
//! environment. Configuration is loaded from `deepscout.toml` in the working
//! directory (or an explicit path) and `DEEPSCOUT_*` environment variables.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Reserved response headroom must stay inside this window.
const MIN_RESERVE_TOKENS: usize = 1_024;
const MAX_RESERVE_TOKENS: usize = 2_048;

/// Top-level configuration for a deepscout research engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoutConfig {
    pub llm: LlmConfig,
    pub crawler: CrawlerConfig,
    pub budget: BudgetConfig,
    pub store: StoreConfig,
    pub search: SearchConfig,
    /// Per-scenario research profiles keyed by scenario tag.
    #[serde(default = "default_scenarios")]
    pub scenarios: HashMap<String, ScenarioProfile>,
}

impl Default for ScoutConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            crawler: CrawlerConfig::default(),
            budget: BudgetConfig::default(),
            store: StoreConfig::default(),
            search: SearchConfig::default(),
            scenarios: default_scenarios(),
        }
    }
}

/// LLM provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name: "openai" or any OpenAI-compatible endpoint.
    pub provider: String,
    /// Model identifier (e.g., "gpt-4o-mini").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Optional base URL override for the API endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Default temperature for generation.
    pub temperature: f32,
    /// Optional context window override; otherwise taken from model metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<usize>,
    /// Retries for transient provider failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff.
    pub retry_initial_delay_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            temperature: 0.3,
            context_window: None,
            max_retries: 2,
            retry_initial_delay_secs: 2,
        }
    }
}

impl LlmConfig {
    /// Validate this LLM config and return any warnings.
    ///
    /// Returns human-readable warning messages for problematic values
    /// (does not error).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.temperature < 0.0 || self.temperature > 2.0 {
            warnings.push(format!(
                "temperature ({}) is outside the typical range 0.0-2.0",
                self.temperature
            ));
        }
        if self.model.is_empty() {
            warnings.push("model is empty".to_string());
        }
        warnings
    }
}

/// Fetcher and browser configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Admission gate width: concurrent fetches per iteration.
    pub max_concurrency: usize,
    /// Candidate links taken per iteration after dedup.
    pub max_links_per_iteration: usize,
    /// Navigation timeout for a browser fetch.
    pub fetch_timeout_secs: u64,
    /// Download + extraction timeout for a PDF fetch.
    pub pdf_timeout_secs: u64,
    /// Attempts per link before it is abandoned.
    pub max_attempts_per_link: u32,
    /// Pre-filter minimum content length in characters.
    pub min_content_length: usize,
    /// Whether to run the browser headless.
    pub headless: bool,
    /// Path to the Chrome/Chromium binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chrome_path: Option<String>,
    /// Viewport width in pixels.
    pub viewport_width: u32,
    /// Viewport height in pixels.
    pub viewport_height: u32,
    /// Egress proxies rotated through on challenge-solve failures
    /// (e.g. "http://host:port").
    #[serde(default)]
    pub proxies: Vec<String>,
    /// Environment variable holding the CAPTCHA solver API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captcha_api_key_env: Option<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            max_links_per_iteration: 10,
            fetch_timeout_secs: 60,
            pdf_timeout_secs: 30,
            max_attempts_per_link: 3,
            min_content_length: 150,
            headless: true,
            chrome_path: None,
            viewport_width: 1920,
            viewport_height: 1080,
            proxies: Vec::new(),
            captcha_api_key_env: None,
        }
    }
}

impl CrawlerConfig {
    /// Validate this crawler config and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.max_concurrency == 0 {
            warnings.push("max_concurrency is 0; no fetch can ever be admitted".to_string());
        } else if !(3..=10).contains(&self.max_concurrency) {
            warnings.push(format!(
                "max_concurrency ({}) is outside the typical range 3-10",
                self.max_concurrency
            ));
        }
        if !(2..=3).contains(&self.max_attempts_per_link) {
            warnings.push(format!(
                "max_attempts_per_link ({}) is outside the typical range 2-3",
                self.max_attempts_per_link
            ));
        }
        warnings
    }
}

/// Token budget and loop-control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Tokens reserved for the model's own response, subtracted from the
    /// context window. Clamped to 1024-2048.
    pub response_reserve_tokens: usize,
    /// Iteration cap for a research session.
    pub max_iterations: u32,
    /// Evidence items to aim for; reaching it stops the session.
    pub target_results: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            response_reserve_tokens: 1_024,
            max_iterations: 5,
            target_results: 10,
        }
    }
}

impl BudgetConfig {
    /// Reserve clamped into the supported window.
    pub fn effective_reserve(&self) -> usize {
        self.response_reserve_tokens
            .clamp(MIN_RESERVE_TOKENS, MAX_RESERVE_TOKENS)
    }

    /// Validate this budget config and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !(MIN_RESERVE_TOKENS..=MAX_RESERVE_TOKENS).contains(&self.response_reserve_tokens) {
            warnings.push(format!(
                "response_reserve_tokens ({}) clamped into {}-{}",
                self.response_reserve_tokens, MIN_RESERVE_TOKENS, MAX_RESERVE_TOKENS
            ));
        }
        if self.max_iterations == 0 {
            warnings.push("max_iterations is 0; the session will do nothing".to_string());
        }
        if self.target_results == 0 {
            warnings.push("target_results is 0; the session stops immediately".to_string());
        }
        warnings
    }
}

/// Content store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path.
    pub db_path: PathBuf,
    /// Dimensions of the embedding vectors written alongside chunks.
    pub embedding_dimensions: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(".deepscout/store.db"),
            embedding_dimensions: 384,
        }
    }
}

/// Web-search expansion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search engine used when no JSON search API is configured.
    pub engine: String,
    /// Environment variable holding a serper-style search API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            engine: "duckduckgo".to_string(),
            api_key_env: None,
        }
    }
}

/// Per-scenario research profile: which store collection to write, which
/// source adapters to query, and how wide the admission gate opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioProfile {
    /// Content store collection (table) name.
    pub collection: String,
    /// Source adapter names consulted during expansion.
    pub sources: Vec<String>,
    /// Optional per-scenario concurrency override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Search URL templates, `{}` replaced by the encoded query.
    #[serde(default)]
    pub search_url_formats: Vec<String>,
}

impl Default for ScenarioProfile {
    fn default() -> Self {
        Self {
            collection: "deepscout_general".to_string(),
            sources: vec!["web".to_string()],
            concurrency: None,
            search_url_formats: Vec::new(),
        }
    }
}

fn default_scenarios() -> HashMap<String, ScenarioProfile> {
    let mut scenarios = HashMap::new();
    scenarios.insert("general".to_string(), ScenarioProfile::default());
    scenarios.insert(
        "technology".to_string(),
        ScenarioProfile {
            collection: "deepscout_technology".to_string(),
            sources: vec!["web".to_string(), "github".to_string()],
            concurrency: None,
            search_url_formats: vec![
                "https://github.com/search?q={}&type=repositories".to_string(),
            ],
        },
    );
    scenarios.insert(
        "paper".to_string(),
        ScenarioProfile {
            collection: "deepscout_paper".to_string(),
            sources: vec!["arxiv".to_string(), "web".to_string()],
            concurrency: None,
            search_url_formats: vec![
                "https://arxiv.org/search/?query={}&searchtype=all".to_string(),
            ],
        },
    );
    scenarios
}

impl ScoutConfig {
    /// Look up a scenario profile, falling back to `general` (and to the
    /// built-in default when even that is missing).
    pub fn scenario(&self, tag: &str) -> ScenarioProfile {
        self.scenarios
            .get(tag)
            .or_else(|| self.scenarios.get("general"))
            .cloned()
            .unwrap_or_default()
    }

    /// Concurrency for a scenario: profile override or the crawler default,
    /// never zero.
    pub fn concurrency_for(&self, tag: &str) -> usize {
        self.scenario(tag)
            .concurrency
            .unwrap_or(self.crawler.max_concurrency)
            .max(1)
    }

    /// Validate the whole config tree and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        warnings.extend(self.llm.validate());
        warnings.extend(self.crawler.validate());
        warnings.extend(self.budget.validate());
        for (tag, profile) in &self.scenarios {
            if profile.sources.is_empty() {
                warnings.push(format!("scenario '{tag}' has no sources"));
            }
        }
        warnings
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `DEEPSCOUT_`)
/// 3. Config file (`deepscout.toml` in the working directory, or the given path)
/// 4. Built-in defaults
pub fn load_config(
    config_path: Option<&Path>,
    overrides: Option<&ScoutConfig>,
) -> Result<ScoutConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(ScoutConfig::default()));

    match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }
        None => {
            let default_path = Path::new("deepscout.toml");
            if default_path.exists() {
                figment = figment.merge(Toml::file(default_path));
            }
        }
    }

    // Environment variables (DEEPSCOUT_LLM__MODEL, DEEPSCOUT_CRAWLER__HEADLESS, etc.)
    figment = figment.merge(Env::prefixed("DEEPSCOUT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })
}
