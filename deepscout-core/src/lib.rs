//! # deepscout core
//!
//! Core library for the deepscout research engine. Provides the research
//! orchestrator, source adapters, content fetching pipeline (browser, PDF,
//! adapter-native HTTP), LLM quality gating and compression, token budget
//! accounting, deduplication, and the persistence sink.
//!
//! The entry point is [`ResearchOrchestrator`]: build one over injected
//! components, call `start_research`, and consume the event stream.

pub mod budget;
pub mod compress;
pub mod config;
pub mod dedup;
pub mod embeddings;
pub mod error;
pub mod fetch;
pub mod gate;
pub mod links;
pub mod llm;
pub mod orchestrator;
pub mod prompts;
pub mod providers;
pub mod session;
pub mod sink;
pub mod sources;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use budget::BudgetAccountant;
pub use compress::ContentCompressor;
pub use config::{CrawlerConfig, ScenarioProfile, ScoutConfig, load_config};
pub use embeddings::{Embedder, HashEmbedder};
pub use error::{
    ConfigError, FetchError, LlmError, Result, ScoutError, SessionError, StoreError,
};
#[cfg(feature = "browser")]
pub use fetch::ChromiumEngine;
pub use fetch::{
    BrowserEngine, CaptchaSolver, DisabledBrowserEngine, Fetcher, HttpCaptchaSolver, PageClient,
};
pub use gate::QualityGate;
pub use llm::{LanguageModel, MockLanguageModel, TokenCounter};
pub use orchestrator::ResearchOrchestrator;
pub use providers::create_provider;
pub use session::ResearchSession;
pub use sink::PersistenceSink;
pub use sources::{SourceAdapter, SourceRegistry, build_http_client};
pub use store::{ContentStore, SqliteContentStore};
pub use types::{
    CandidateLink, EvidenceItem, FetchedContent, QualityVerdict, ResearchEvent, ResearchOutcome,
    ResearchPhase, SufficiencyVerdict, TerminationReason,
};
