//! Content quality gate: rule-based pre-filter plus LLM assessment.
//!
//! The pre-filter rejects obviously unusable text (too short, garbled,
//! repetitive, spam, anti-bot interstitials) before any LLM is involved.
//! Text that survives goes to the model with the quality prompt; the
//! verdict decides whether the page becomes evidence.

use crate::llm::LanguageModel;
use crate::prompts;
use crate::types::QualityVerdict;
use std::sync::Arc;
use tracing::{debug, warn};

/// Word count above which the gate asks for a compressed body.
const COMPRESS_ABOVE_WORDS: usize = 5_000;

/// Character cap on the article text interpolated into the gate prompt,
/// sized to keep the prompt inside small context windows.
const MAX_GATE_CONTENT_CHARS: usize = 24_000;

/// Ratio of non-prose characters above which text counts as garbled.
const GARBLED_RATIO: f64 = 0.3;

/// Minimum unique-word ratio for texts longer than `DIVERSITY_MIN_WORDS`.
const DIVERSITY_RATIO: f64 = 0.4;
const DIVERSITY_MIN_WORDS: usize = 20;

const SPAM_KEYWORDS: &[&str] = &[
    "click here",
    "buy now",
    "limited offer",
    "free download",
    "make money",
    "earn cash",
    "点击这里",
    "立即购买",
    "限时优惠",
    "免费领取",
    "点击下载",
    "立即注册",
    "低价出售",
    "【广告】",
];

const ANTI_BOT_PHRASES: &[&str] = &[
    "detected unusual traffic",
    "systems have detected unusual",
    "ip address:",
    "this page checks",
    "see if it's really you",
    "not a robot",
    "why did this happen",
];

fn is_prose_char(c: char) -> bool {
    c.is_whitespace()
        || c.is_ascii_alphanumeric()
        || ('\u{4E00}'..='\u{9FA5}').contains(&c)
        || "，。！？、,.!?".contains(c)
}

/// Rule-based pre-filter. Returns the rejection reason, or `Ok` when the
/// text is worth an LLM call.
pub fn prefilter(text: &str, min_length: usize) -> Result<(), String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty content".to_string());
    }

    let char_count = trimmed.chars().count();
    if char_count < min_length {
        return Err(format!("content too short ({char_count} chars)"));
    }

    let garbled = trimmed.chars().filter(|c| !is_prose_char(*c)).count();
    let garbled_ratio = garbled as f64 / char_count as f64;
    if garbled_ratio > GARBLED_RATIO {
        return Err(format!("garbled content ({:.0}% non-prose)", garbled_ratio * 100.0));
    }

    let words: Vec<&str> = trimmed.split_whitespace().collect();
    if words.len() > DIVERSITY_MIN_WORDS {
        let unique: std::collections::HashSet<&str> = words.iter().copied().collect();
        let diversity = unique.len() as f64 / words.len() as f64;
        if diversity < DIVERSITY_RATIO {
            return Err(format!("repetitive content (diversity {diversity:.2})"));
        }
    }

    let lower = trimmed.to_lowercase();
    if let Some(keyword) = SPAM_KEYWORDS.iter().find(|k| lower.contains(&k.to_lowercase())) {
        return Err(format!("spam keyword: {keyword}"));
    }
    if let Some(phrase) = ANTI_BOT_PHRASES.iter().find(|p| lower.contains(*p)) {
        return Err(format!("anti-bot interstitial: {phrase}"));
    }

    Ok(())
}

/// LLM quality gate over pre-filtered article text.
pub struct QualityGate {
    model: Arc<dyn LanguageModel>,
}

impl QualityGate {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Assess one fetched document against the query.
    ///
    /// Never errors: a failed call or malformed output degrades to a
    /// rejecting verdict.
    pub async fn assess(&self, query: &str, url: &str, content: &str) -> QualityVerdict {
        let clipped = prompts::clip(content, MAX_GATE_CONTENT_CHARS);
        let prompt = prompts::quality_prompt(query, &clipped, COMPRESS_ABOVE_WORDS);

        match self.model.generate_structured(&prompt).await {
            Ok(value) => match serde_json::from_value::<QualityVerdict>(value) {
                Ok(verdict) => {
                    debug!(url, accept = verdict.accept, reason = %verdict.reason, "quality verdict");
                    verdict
                }
                Err(e) => {
                    warn!(url, error = %e, "quality gate output malformed, rejecting");
                    QualityVerdict::evaluation_failed()
                }
            },
            Err(e) => {
                warn!(url, error = %e, "quality gate call failed, rejecting");
                QualityVerdict::evaluation_failed()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLanguageModel;

    const MIN_LENGTH: usize = 150;

    fn english_paragraph() -> String {
        "Rust is a systems programming language focused on safety and performance. \
         Its ownership model eliminates whole classes of memory bugs at compile time, \
         and the async ecosystem built around tokio makes highly concurrent network \
         services practical without data races."
            .to_string()
    }

    #[test]
    fn test_prefilter_accepts_prose() {
        assert!(prefilter(&english_paragraph(), MIN_LENGTH).is_ok());
    }

    #[test]
    fn test_prefilter_rejects_empty_and_short() {
        assert!(prefilter("", MIN_LENGTH).is_err());
        assert!(prefilter("   ", MIN_LENGTH).is_err());
        let reason = prefilter("too short to be an article", MIN_LENGTH).unwrap_err();
        assert!(reason.contains("too short"));
    }

    #[test]
    fn test_prefilter_rejects_garbled() {
        let garbled = ":::###%%%///@@@^^^&&&***((()))".repeat(10);
        let reason = prefilter(&garbled, MIN_LENGTH).unwrap_err();
        assert!(reason.contains("garbled"));
    }

    #[test]
    fn test_prefilter_rejects_repetition() {
        let repetitive = "spam ".repeat(40);
        let reason = prefilter(&repetitive, MIN_LENGTH).unwrap_err();
        assert!(reason.contains("repetitive"));
    }

    #[test]
    fn test_prefilter_rejects_spam_keyword() {
        let text = format!("{} Click here to claim your prize now.", english_paragraph());
        let reason = prefilter(&text, MIN_LENGTH).unwrap_err();
        assert!(reason.contains("spam keyword"));
    }

    #[test]
    fn test_prefilter_rejects_anti_bot_page() {
        let text = format!(
            "{} Please verify you are not a robot before continuing.",
            english_paragraph()
        );
        let reason = prefilter(&text, MIN_LENGTH).unwrap_err();
        assert!(reason.contains("anti-bot"));
    }

    #[test]
    fn test_prefilter_accepts_cjk_prose() {
        // CJK text has no whitespace word boundaries; the diversity rule
        // must not fire on it.
        let text = "\u{4EBA}\u{5DE5}\u{667A}\u{80FD}\u{6B63}\u{5728}\u{6539}\u{53D8}\u{533B}\u{7597}"
            .repeat(20);
        assert!(prefilter(&text, MIN_LENGTH).is_ok());
    }

    #[tokio::test]
    async fn test_assess_accepting_verdict() {
        let model = Arc::new(MockLanguageModel::new());
        model.queue(
            r#"{"accept": true, "title": "Rust ownership", "reason": "relevant", "scenario": "technology"}"#,
        );
        let gate = QualityGate::new(model.clone());
        let verdict = gate.assess("rust", "https://a.example", &english_paragraph()).await;
        assert!(verdict.accept);
        assert_eq!(verdict.title, "Rust ownership");
        assert_eq!(verdict.scenario, "technology");
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_assess_malformed_output_rejects() {
        let model = Arc::new(MockLanguageModel::new());
        model.queue("I refuse to answer in JSON today.");
        let gate = QualityGate::new(model);
        let verdict = gate.assess("q", "https://a.example", "content").await;
        assert!(!verdict.accept);
        assert_eq!(verdict.reason, "evaluation failed");
    }

    #[tokio::test]
    async fn test_assess_call_failure_rejects() {
        let model = Arc::new(MockLanguageModel::new());
        model.queue_error(crate::error::LlmError::Timeout { timeout_secs: 5 });
        let gate = QualityGate::new(model);
        let verdict = gate.assess("q", "https://a.example", "content").await;
        assert!(!verdict.accept);
    }

    #[tokio::test]
    async fn test_assess_uses_compressed_body_field() {
        let model = Arc::new(MockLanguageModel::new());
        model.queue(
            r#"```json
{"accept": true, "title": "T", "reason": "ok", "compressed_article": "shortened body"}
```"#,
        );
        let gate = QualityGate::new(model);
        let verdict = gate.assess("q", "https://a.example", "content").await;
        assert_eq!(verdict.compressed_body.as_deref(), Some("shortened body"));
    }
}
