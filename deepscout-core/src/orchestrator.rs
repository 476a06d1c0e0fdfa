//! The research loop.
//!
//! Drives `EVALUATING → EXPANDING → FETCHING → BUDGETING → (COMPRESSING)`
//! iterations over an injected component graph until the sufficiency verdict
//! says stop, the evidence target is met, the iteration cap is hit, or the
//! session is cancelled. Component failures inside an iteration (a source
//! that will not expand, a link that will not fetch, a store that will not
//! write) degrade to skipped work; they never abort the session.

use crate::budget::BudgetAccountant;
use crate::compress::ContentCompressor;
use crate::config::ScoutConfig;
use crate::dedup::Deduplicator;
use crate::embeddings::Embedder;
use crate::fetch::Fetcher;
use crate::gate::QualityGate;
use crate::llm::{LanguageModel, TokenCounter};
use crate::prompts::sufficiency_prompt;
use crate::session::ResearchSession;
use crate::sink::PersistenceSink;
use crate::sources::SourceRegistry;
use crate::store::ContentStore;
use crate::types::{
    CandidateLink, EvidenceItem, ResearchEvent, ResearchOutcome, ResearchPhase,
    SufficiencyVerdict, TerminationReason,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Buffered events between a running session and its consumer.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Drives research sessions over injected components.
///
/// The orchestrator itself is stateless across runs; everything mutable
/// lives in the per-run [`ResearchSession`].
pub struct ResearchOrchestrator {
    model: Arc<dyn LanguageModel>,
    registry: Arc<SourceRegistry>,
    fetcher: Fetcher,
    store: Arc<dyn ContentStore>,
    embedder: Arc<dyn Embedder>,
    config: ScoutConfig,
    cancel: CancellationToken,
}

impl ResearchOrchestrator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        registry: Arc<SourceRegistry>,
        fetcher: Fetcher,
        store: Arc<dyn ContentStore>,
        embedder: Arc<dyn Embedder>,
        config: ScoutConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            model,
            registry,
            fetcher,
            store,
            embedder,
            config,
            cancel,
        }
    }

    /// Spawn a session and hand back its event stream plus the awaitable
    /// outcome. This is the crate boundary callers are expected to use.
    pub fn start_research(
        self: &Arc<Self>,
        query: impl Into<String>,
        scenario: Option<String>,
    ) -> (ReceiverStream<ResearchEvent>, JoinHandle<ResearchOutcome>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let orchestrator = Arc::clone(self);
        let query = query.into();
        let handle = tokio::spawn(async move { orchestrator.run(&query, scenario, tx).await });
        (ReceiverStream::new(rx), handle)
    }

    /// Run one research session to completion.
    ///
    /// Infallible by design: every failure either degrades (LLM calls,
    /// sources, persistence) or terminates the loop with a reason.
    pub async fn run(
        &self,
        query: &str,
        scenario: Option<String>,
        events: mpsc::Sender<ResearchEvent>,
    ) -> ResearchOutcome {
        let mut session = ResearchSession::new(query, scenario);
        info!(query, scenario = session.scenario(), "research session starting");

        let gate = QualityGate::new(Arc::clone(&self.model));
        let compressor = ContentCompressor::new(Arc::clone(&self.model));
        let sink = PersistenceSink::new(Arc::clone(&self.store), Arc::clone(&self.embedder));
        let mut dedup = Deduplicator::new(Arc::clone(&self.store));

        let context_window = self
            .config
            .llm
            .context_window
            .unwrap_or_else(|| self.model.context_window());
        let budget = BudgetAccountant::new(
            TokenCounter::for_model(self.model.model_name()),
            context_window,
            self.config.budget.effective_reserve(),
        );

        let reason = 'research: loop {
            if self.cancel.is_cancelled() {
                break 'research TerminationReason::Cancelled;
            }
            if session.iteration() >= self.config.budget.max_iterations {
                break 'research TerminationReason::IterationCap;
            }
            let iteration = session.begin_iteration();

            // EVALUATING
            session.transition(ResearchPhase::Evaluating);
            self.emit(
                &events,
                ResearchEvent::status(
                    ResearchPhase::Evaluating,
                    iteration,
                    format!(
                        "judging sufficiency of {} evidence items",
                        session.evidence_count()
                    ),
                ),
            )
            .await;
            let verdict = self.evaluate(&session).await;
            if let Some(tag) = verdict.scenario.as_deref() {
                if session.pin_scenario(tag) {
                    self.emit(
                        &events,
                        ResearchEvent::status(
                            ResearchPhase::Evaluating,
                            iteration,
                            format!("scenario pinned to {tag}"),
                        ),
                    )
                    .await;
                }
            }
            if verdict.enough {
                break 'research TerminationReason::Sufficient;
            }
            if session.evidence_count() >= self.config.budget.target_results {
                break 'research TerminationReason::TargetReached;
            }

            // EXPANDING
            session.transition(ResearchPhase::Expanding);
            if verdict.search_urls.is_empty() {
                self.emit(
                    &events,
                    ResearchEvent::status(
                        ResearchPhase::Expanding,
                        iteration,
                        "verdict proposed no search urls; moving to the next iteration",
                    ),
                )
                .await;
                continue;
            }
            self.emit(
                &events,
                ResearchEvent::status(
                    ResearchPhase::Expanding,
                    iteration,
                    format!("expanding {} search urls", verdict.search_urls.len()),
                ),
            )
            .await;
            let candidates = self.expand(&session, &verdict.search_urls, &events).await;

            let links = match dedup
                .filter(candidates, self.config.crawler.max_links_per_iteration)
                .await
            {
                Ok(links) => links,
                Err(err) => {
                    warn!(error = %err, "store lookup failed during dedup; skipping iteration");
                    self.emit(
                        &events,
                        ResearchEvent::error(format!("dedup store lookup failed: {err}"), None),
                    )
                    .await;
                    continue;
                }
            };
            if links.is_empty() {
                self.emit(
                    &events,
                    ResearchEvent::status(
                        ResearchPhase::Expanding,
                        iteration,
                        "no fresh links after deduplication",
                    ),
                )
                .await;
                continue;
            }

            // FETCHING
            session.transition(ResearchPhase::Fetching);
            self.emit(
                &events,
                ResearchEvent::status(
                    ResearchPhase::Fetching,
                    iteration,
                    format!("fetching {} links", links.len()),
                ),
            )
            .await;

            let mut rx = self.fetcher.fetch_all(links);
            let mut accepted: Vec<EvidenceItem> = Vec::new();
            loop {
                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => {
                        break 'research TerminationReason::Cancelled;
                    }
                    result = rx.recv() => match result {
                        Some(result) => result,
                        None => break,
                    },
                };
                let fetched = match result {
                    Ok(fetched) => fetched,
                    Err(err) => {
                        warn!(error = %err, "link fetch failed");
                        let url = err.url().map(str::to_string);
                        self.emit(&events, ResearchEvent::error(err.to_string(), url))
                            .await;
                        continue;
                    }
                };
                if session.evidence_count() >= self.config.budget.target_results {
                    debug!("evidence target reached; skipping remaining fetches");
                    break;
                }
                if session.contains_url(&fetched.link.url) {
                    continue;
                }

                let verdict = gate
                    .assess(session.query(), &fetched.link.url, &fetched.text)
                    .await;
                if !verdict.accept {
                    self.emit(
                        &events,
                        ResearchEvent::status(
                            ResearchPhase::Fetching,
                            iteration,
                            format!("rejected {}: {}", fetched.link.url, verdict.reason),
                        ),
                    )
                    .await;
                    continue;
                }

                let title = if verdict.title.trim().is_empty() {
                    fetched.link.url.clone()
                } else {
                    verdict.title
                };
                let gate_compressed = verdict.compressed_body.is_some();
                let content = verdict.compressed_body.unwrap_or(fetched.text);
                let mut item = EvidenceItem::new(fetched.link.url.clone(), title, content)
                    .with_scenario(verdict.scenario);
                if gate_compressed {
                    item = item.mark_compressed();
                }

                // BUDGETING / COMPRESSING
                session.transition(ResearchPhase::Budgeting);
                let new_tokens = budget.count(&item.content);
                let current = budget.total(session.evidence());
                if budget.would_overflow(current, new_tokens) {
                    session.transition(ResearchPhase::Compressing);
                    self.emit(
                        &events,
                        ResearchEvent::status(
                            ResearchPhase::Compressing,
                            iteration,
                            format!(
                                "budget would overflow ({current} + {new_tokens} tokens); compressing"
                            ),
                        ),
                    )
                    .await;
                    let existing = session.evidence().to_vec();
                    let compacted = compressor
                        .compress(session.query(), existing, item.clone(), &budget)
                        .await;
                    session.replace_evidence(compacted);
                } else if !session.add_evidence(item.clone()) {
                    continue;
                }
                self.emit(
                    &events,
                    ResearchEvent::Evidence {
                        url: item.url.clone(),
                        title: item.title.clone(),
                        tokens: new_tokens,
                    },
                )
                .await;
                accepted.push(item);
                session.transition(ResearchPhase::Fetching);
            }

            // Persist what this iteration gathered; failures are logged
            // inside the sink and never fail the session.
            if !accepted.is_empty() {
                let written = sink.persist(&accepted).await;
                debug!(
                    iteration,
                    accepted = accepted.len(),
                    written,
                    "persisted iteration evidence"
                );
            }
        };

        let outcome = session.finish(reason);
        self.emit(
            &events,
            ResearchEvent::status(
                ResearchPhase::Done,
                outcome.iterations,
                format!(
                    "{} evidence items after {} iterations ({})",
                    outcome.evidence.len(),
                    outcome.iterations,
                    outcome.reason
                ),
            ),
        )
        .await;
        info!(
            items = outcome.evidence.len(),
            iterations = outcome.iterations,
            reason = %outcome.reason,
            "research session finished"
        );
        self.fetcher.shutdown().await;
        outcome
    }

    /// One sufficiency call, parsed leniently. Failures degrade to the
    /// conservative verdict instead of erroring.
    async fn evaluate(&self, session: &ResearchSession) -> SufficiencyVerdict {
        let profile = self.config.scenario(session.scenario());
        let prompt = sufficiency_prompt(
            session.query(),
            session.evidence(),
            &profile.search_url_formats,
        );
        match self.model.generate_structured(&prompt).await {
            Ok(value) => match serde_json::from_value(value) {
                Ok(verdict) => verdict,
                Err(err) => {
                    warn!(error = %err, "sufficiency verdict did not match the expected shape");
                    SufficiencyVerdict::evaluation_failed()
                }
            },
            Err(err) => {
                warn!(error = %err, "sufficiency call failed");
                SufficiencyVerdict::evaluation_failed()
            }
        }
    }

    /// Give every search URL to every adapter of the session's scenario.
    /// A failing source is reported and skipped.
    async fn expand(
        &self,
        session: &ResearchSession,
        search_urls: &[String],
        events: &mpsc::Sender<ResearchEvent>,
    ) -> Vec<CandidateLink> {
        let profile = self.config.scenario(session.scenario());
        let adapters = self.registry.adapters_for(&profile.sources);
        let mut candidates = Vec::new();
        for url in search_urls {
            for adapter in &adapters {
                match adapter.expand(url).await {
                    Ok(links) => {
                        debug!(
                            source = adapter.name(),
                            count = links.len(),
                            "expanded search url"
                        );
                        candidates.extend(
                            links
                                .into_iter()
                                .map(|link| CandidateLink::new(link, adapter.name())),
                        );
                    }
                    Err(err) => {
                        warn!(source = adapter.name(), error = %err, "source expansion failed");
                        self.emit(
                            events,
                            ResearchEvent::error(
                                format!("{} expansion failed: {err}", adapter.name()),
                                Some(url.clone()),
                            ),
                        )
                        .await;
                    }
                }
            }
        }
        candidates
    }

    async fn emit(&self, events: &mpsc::Sender<ResearchEvent>, event: ResearchEvent) {
        if events.send(event).await.is_err() {
            debug!("event receiver dropped; continuing without a listener");
        }
    }
}
