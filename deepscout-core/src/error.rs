//! Error types for the deepscout research core.
//!
//! Uses `thiserror` for public API error types with structured error variants
//! covering LLM, fetching, persistence, configuration, and session domains.

use std::path::PathBuf;

/// Top-level error type for the deepscout core library.
#[derive(Debug, thiserror::Error)]
pub enum ScoutError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from LLM provider interactions.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("API request failed: {message}")]
    ApiRequest { message: String },

    #[error("API response parse error: {message}")]
    ResponseParse { message: String },

    #[error("Context window exceeded: used {used} of {limit} tokens")]
    ContextOverflow { used: usize, limit: usize },

    #[error("Model not supported: {model}")]
    UnsupportedModel { model: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Provider connection failed: {message}")]
    Connection { message: String },
}

/// Errors from fetching a single candidate link.
///
/// These are per-link by design: one failed link never aborts the research
/// session, it only produces an error event for that URL.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },

    #[error("Fetch of {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    #[error("HTTP request to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("Unsolvable {kind} challenge at {url}")]
    ChallengeUnsolvable { url: String, kind: String },

    #[error("Content from {url} rejected by pre-filter: {reason}")]
    LowQuality { url: String, reason: String },

    #[error("PDF extraction failed for {url}: {message}")]
    PdfExtract { url: String, message: String },

    #[error("Session error: {message}")]
    Session { message: String },

    #[error("Empty body returned for {url}")]
    EmptyBody { url: String },
}

/// Errors from the content store and embedding pipeline.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store at {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Store query failed: {message}")]
    Query { message: String },

    #[error("Store write failed: {message}")]
    Write { message: String },

    #[error("Embedding failed: {message}")]
    Embedding { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

/// Errors from the research session orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Maximum iterations ({max}) reached without sufficient evidence")]
    MaxIterationsReached { max: u32 },

    #[error("Research session was cancelled")]
    Cancelled,

    #[error("Event channel closed before session finished")]
    ChannelClosed,
}

/// A type alias for results using the top-level `ScoutError`.
pub type Result<T> = std::result::Result<T, ScoutError>;

impl FetchError {
    /// The URL this fetch failure belongs to, when one is attached.
    pub fn url(&self) -> Option<&str> {
        match self {
            FetchError::Navigation { url, .. }
            | FetchError::Timeout { url, .. }
            | FetchError::Http { url, .. }
            | FetchError::ChallengeUnsolvable { url, .. }
            | FetchError::LowQuality { url, .. }
            | FetchError::PdfExtract { url, .. }
            | FetchError::EmptyBody { url } => Some(url),
            FetchError::Session { .. } => None,
        }
    }
}
