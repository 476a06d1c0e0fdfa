//! Core type definitions for the deepscout research engine.
//!
//! Defines the data structures that flow between the orchestrator, fetcher,
//! quality gate, budget accountant, compressor, and persistence sink:
//! evidence items, verdicts, events, and store records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Phase of the research loop, in the order a single iteration visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchPhase {
    Evaluating,
    Expanding,
    Fetching,
    Budgeting,
    Compressing,
    Done,
}

impl std::fmt::Display for ResearchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResearchPhase::Evaluating => write!(f, "evaluating"),
            ResearchPhase::Expanding => write!(f, "expanding"),
            ResearchPhase::Fetching => write!(f, "fetching"),
            ResearchPhase::Budgeting => write!(f, "budgeting"),
            ResearchPhase::Compressing => write!(f, "compressing"),
            ResearchPhase::Done => write!(f, "done"),
        }
    }
}

/// Why a research session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The sufficiency verdict judged the evidence adequate.
    Sufficient,
    /// The iteration cap was hit before the verdict turned positive.
    IterationCap,
    /// The configured target number of evidence items was collected.
    TargetReached,
    /// The session was cancelled; evidence is partial.
    Cancelled,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminationReason::Sufficient => write!(f, "sufficient"),
            TerminationReason::IterationCap => write!(f, "iteration cap"),
            TerminationReason::TargetReached => write!(f, "target reached"),
            TerminationReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An accepted piece of research material.
///
/// Items enter the session's working set only through a positive quality
/// gate verdict; their combined token count is kept under the effective
/// budget by the compressor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub url: String,
    pub title: String,
    pub content: String,
    /// True once an LLM (gate or compressor) has shortened the content.
    pub compressed: bool,
    pub scenario: String,
    pub gathered_at: DateTime<Utc>,
}

impl EvidenceItem {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            content: content.into(),
            compressed: false,
            scenario: "general".to_string(),
            gathered_at: Utc::now(),
        }
    }

    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = scenario.into();
        self
    }

    pub fn mark_compressed(mut self) -> Self {
        self.compressed = true;
        self
    }
}

/// A URL proposed for fetching, tagged with the adapter that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateLink {
    pub url: String,
    pub source: String,
}

impl CandidateLink {
    pub fn new(url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source: source.into(),
        }
    }
}

/// Raw text successfully pulled from one candidate link.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub link: CandidateLink,
    pub text: String,
}

/// The LLM's judgment on whether the collected evidence answers the query.
///
/// Parsed leniently: every field has a default so a partially well-formed
/// reply still yields a usable verdict. A failed call degrades to
/// [`SufficiencyVerdict::evaluation_failed`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SufficiencyVerdict {
    #[serde(default)]
    pub enough: bool,
    #[serde(default, alias = "search_url")]
    pub search_urls: Vec<String>,
    #[serde(default, alias = "thought")]
    pub rationale: String,
    /// Scenario tag the model recognized for the query, when it named one.
    #[serde(default)]
    pub scenario: Option<String>,
}

impl SufficiencyVerdict {
    /// Conservative default when the sufficiency call fails or returns
    /// something unparsable: not enough, no new URLs.
    pub fn evaluation_failed() -> Self {
        Self {
            enough: false,
            search_urls: Vec::new(),
            rationale: "evaluation failed".to_string(),
            scenario: None,
        }
    }
}

/// The quality gate's verdict on one fetched document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityVerdict {
    #[serde(default)]
    pub accept: bool,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub reason: String,
    /// Gate-produced shortened body; used as evidence content when present.
    #[serde(default, alias = "compressed_article")]
    pub compressed_body: Option<String>,
    #[serde(default = "default_scenario")]
    pub scenario: String,
}

fn default_scenario() -> String {
    "general".to_string()
}

impl QualityVerdict {
    /// Conservative default for malformed gate output.
    pub fn evaluation_failed() -> Self {
        Self {
            accept: false,
            title: String::new(),
            reason: "evaluation failed".to_string(),
            compressed_body: None,
            scenario: default_scenario(),
        }
    }
}

/// One entry of a compression plan returned by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedEntry {
    /// Index into the existing evidence list; -1 refers to the new item.
    #[serde(default = "default_original_index")]
    pub original_index: i64,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub compressed: bool,
}

fn default_original_index() -> i64 {
    -1
}

/// Free-form notes the model attaches to a compression plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanNotes {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub strategy: String,
}

/// The full compression plan: which items survive and in what form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompressionPlan {
    #[serde(default)]
    pub decisions: Option<PlanNotes>,
    #[serde(default)]
    pub compressed_results: Vec<CompressedEntry>,
}

/// A chunked, embedded row bound for the content store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub id: String,
    pub url: String,
    pub title: String,
    pub content_chunk: String,
    pub embedding: Vec<f32>,
    /// Epoch milliseconds.
    pub created_at: i64,
}

impl ContentRecord {
    pub fn new(
        url: impl Into<String>,
        title: impl Into<String>,
        content_chunk: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: url.into(),
            title: title.into(),
            content_chunk: content_chunk.into(),
            embedding,
            created_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Events emitted by a running research session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResearchEvent {
    Status {
        phase: ResearchPhase,
        iteration: u32,
        message: String,
    },
    Evidence {
        url: String,
        title: String,
        tokens: usize,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
}

impl ResearchEvent {
    pub fn status(phase: ResearchPhase, iteration: u32, message: impl Into<String>) -> Self {
        ResearchEvent::Status {
            phase,
            iteration,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>, url: Option<String>) -> Self {
        ResearchEvent::Error {
            message: message.into(),
            url,
        }
    }
}

/// Final result of a research session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchOutcome {
    pub evidence: Vec<EvidenceItem>,
    pub iterations: u32,
    pub reason: TerminationReason,
}
