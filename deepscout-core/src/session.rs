//! Per-run research session state.
//!
//! A session owns everything that changes while a query is being researched:
//! the current phase, the iteration counter, the working evidence list, and
//! the scenario tag. Evidence URLs stay unique for the life of the session.
//! The orchestrator mutates the session; nothing else does.

use crate::prompts::is_known_scenario;
use crate::types::{EvidenceItem, ResearchOutcome, ResearchPhase, TerminationReason};
use std::collections::HashSet;
use tracing::debug;

/// Scenario value meaning "let the sufficiency verdict pick one".
pub const AUTO_SCENARIO: &str = "auto";

/// Scenario used for prompt and profile lookups until one is pinned.
pub const DEFAULT_SCENARIO: &str = "general";

/// Mutable state of one research run.
pub struct ResearchSession {
    query: String,
    scenario: String,
    auto_scenario: bool,
    phase: ResearchPhase,
    iteration: u32,
    evidence: Vec<EvidenceItem>,
    evidence_urls: HashSet<String>,
}

impl ResearchSession {
    /// `None` (or the literal tag `auto`) leaves scenario selection to the
    /// first sufficiency verdict that names a recognized one.
    pub fn new(query: impl Into<String>, scenario: Option<String>) -> Self {
        let (scenario, auto) = match scenario {
            Some(tag) if tag != AUTO_SCENARIO => (tag, false),
            _ => (DEFAULT_SCENARIO.to_string(), true),
        };
        Self {
            query: query.into(),
            scenario,
            auto_scenario: auto,
            phase: ResearchPhase::Evaluating,
            iteration: 0,
            evidence: Vec::new(),
            evidence_urls: HashSet::new(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    /// Effective scenario tag; `general` while auto selection is pending.
    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn is_auto_scenario(&self) -> bool {
        self.auto_scenario
    }

    /// Pin the scenario suggested by a verdict. Only applies while the
    /// session is in auto mode and only for recognized tags; returns
    /// whether the scenario was pinned.
    pub fn pin_scenario(&mut self, tag: &str) -> bool {
        if !self.auto_scenario || tag == AUTO_SCENARIO || !is_known_scenario(tag) {
            return false;
        }
        debug!(scenario = tag, "pinned session scenario");
        self.scenario = tag.to_string();
        self.auto_scenario = false;
        true
    }

    pub fn phase(&self) -> ResearchPhase {
        self.phase
    }

    pub fn transition(&mut self, phase: ResearchPhase) {
        debug!(from = %self.phase, to = %phase, iteration = self.iteration, "phase transition");
        self.phase = phase;
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Advance to the next iteration and return its number (1-based).
    pub fn begin_iteration(&mut self) -> u32 {
        self.iteration += 1;
        self.iteration
    }

    pub fn evidence(&self) -> &[EvidenceItem] {
        &self.evidence
    }

    pub fn evidence_count(&self) -> usize {
        self.evidence.len()
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.evidence_urls.contains(url)
    }

    /// Append an item; refused when its URL is already in the working set.
    pub fn add_evidence(&mut self, item: EvidenceItem) -> bool {
        if !self.evidence_urls.insert(item.url.clone()) {
            debug!(url = %item.url, "evidence for this url already collected");
            return false;
        }
        self.evidence.push(item);
        true
    }

    /// Swap in a compressed working set, rebuilding the URL index.
    pub fn replace_evidence(&mut self, items: Vec<EvidenceItem>) {
        self.evidence_urls = items.iter().map(|item| item.url.clone()).collect();
        self.evidence = items;
    }

    /// Close the session and produce its outcome.
    pub fn finish(mut self, reason: TerminationReason) -> ResearchOutcome {
        self.transition(ResearchPhase::Done);
        ResearchOutcome {
            evidence: self.evidence,
            iterations: self.iteration,
            reason,
        }
    }
}
