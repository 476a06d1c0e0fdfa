//! LLM abstraction for the research engine.
//!
//! Defines the `LanguageModel` trait the orchestrator, quality gate, and
//! compressor talk to, a BPE token counter with a conservative char-ratio
//! fallback, and lenient JSON extraction for model output that arrives
//! wrapped in prose or code fences.

use crate::error::LlmError;
use async_trait::async_trait;
use regex::Regex;

/// Trait for language model providers.
///
/// Everything the engine needs from a model: free-form generation,
/// structured (JSON) generation, and enough metadata to size the token
/// budget against the right context window.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate a completion for the prompt.
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    /// Generate a completion and extract the JSON object it carries.
    ///
    /// Models wrap JSON in prose or code fences often enough that this
    /// goes through [`extract_json`] rather than a strict parse.
    async fn generate_structured(&self, prompt: &str) -> Result<serde_json::Value, LlmError> {
        let raw = self.generate(prompt).await?;
        extract_json(&raw).ok_or_else(|| LlmError::ResponseParse {
            message: format!("no JSON object found in {} chars of output", raw.len()),
        })
    }

    /// Return the model name.
    fn model_name(&self) -> &str;

    /// Return the context window size for this provider/model.
    fn context_window(&self) -> usize;
}

/// Extract a JSON object from raw model output.
///
/// Tries three stages, mirroring how models actually misbehave:
/// 1. the whole output parses as JSON;
/// 2. a ```json fenced block parses;
/// 3. the span from the first `{` to the last `}` parses.
///
/// Returns `None` when no stage yields a JSON value.
pub fn extract_json(raw: &str) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }

    if let Ok(fence) = Regex::new(r"(?s)```json\s*(.*?)```") {
        if let Some(caps) = fence.captures(trimmed) {
            if let Ok(value) = serde_json::from_str(caps[1].trim()) {
                return Some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if start < end {
        if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
            return Some(value);
        }
    }
    None
}

/// Token counter using tiktoken-rs BPE, with a char-ratio fallback.
///
/// The fallback deliberately overestimates CJK text (one token per CJK
/// char) so budget checks stay conservative when no BPE is available.
pub struct TokenCounter {
    bpe: Option<tiktoken_rs::CoreBPE>,
}

impl TokenCounter {
    /// Create a token counter for the given model.
    ///
    /// Falls back to cl100k_base when the model isn't recognized, and to
    /// the char-ratio heuristic when no BPE can be built at all.
    pub fn for_model(model: &str) -> Self {
        let bpe = tiktoken_rs::get_bpe_from_model(model)
            .or_else(|_| tiktoken_rs::cl100k_base())
            .ok();
        Self { bpe }
    }

    /// Create a counter that only uses the char-ratio heuristic.
    pub fn approximate() -> Self {
        Self { bpe: None }
    }

    /// Count the number of tokens in a string.
    pub fn count(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => approximate_tokens(text),
        }
    }
}

/// Char-ratio token estimate: ~4 chars per token for non-CJK text, one
/// token per CJK char (overestimate, so budgets err on the safe side).
pub fn approximate_tokens(text: &str) -> usize {
    let mut cjk = 0usize;
    let mut other = 0usize;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    cjk + other.div_ceil(4)
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}'   // CJK Unified Ideographs
        | '\u{3400}'..='\u{4DBF}' // CJK Extension A
        | '\u{3040}'..='\u{30FF}' // Hiragana + Katakana
        | '\u{AC00}'..='\u{D7AF}' // Hangul syllables
    )
}

/// A mock language model for testing and development.
///
/// Responses are queued and returned in order; every prompt is recorded so
/// tests can assert how many calls a component made and with what.
pub struct MockLanguageModel {
    model: String,
    context_window: usize,
    responses: std::sync::Mutex<Vec<Result<String, LlmError>>>,
    prompts: std::sync::Mutex<Vec<String>>,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            context_window: 128_000,
            responses: std::sync::Mutex::new(Vec::new()),
            prompts: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Create a mock that always returns the given text.
    ///
    /// Queues multiple copies of the response so it can handle multiple calls.
    pub fn with_response(text: &str) -> Self {
        let model = Self::new();
        for _ in 0..20 {
            model.queue(text);
        }
        model
    }

    /// Queue a response to be returned by the next `generate` call.
    pub fn queue(&self, text: impl Into<String>) {
        self.responses.lock().unwrap().push(Ok(text.into()));
    }

    /// Queue an error to be returned by the next `generate` call.
    pub fn queue_error(&self, err: LlmError) {
        self.responses.lock().unwrap().push(Err(err));
    }

    /// Number of `generate` calls made so far.
    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn with_context_window(mut self, window: usize) -> Self {
        self.context_window = window;
        self
    }
}

impl Default for MockLanguageModel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("Mock model: no queued responses available.".to_string())
        } else {
            responses.remove(0)
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn context_window(&self) -> usize {
        self.context_window
    }
}
