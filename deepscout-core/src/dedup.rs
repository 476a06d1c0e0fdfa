//! Candidate link deduplication.
//!
//! Every URL headed for the fetcher first passes through here: it is
//! normalized, checked against the session's seen-set, then checked against
//! the persistent store so content ingested by an earlier session is not
//! fetched again.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::error::StoreError;
use crate::links::{is_fetchable_url, normalize_url};
use crate::store::ContentStore;
use crate::types::CandidateLink;

/// How many URLs go into a single store existence query.
pub const STORE_BATCH_SIZE: usize = 50;

/// Session-scoped deduplicator. The seen-set lives as long as the research
/// session; persistence checks go through the shared store.
pub struct Deduplicator {
    store: Arc<dyn ContentStore>,
    seen: HashSet<String>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            seen: HashSet::new(),
        }
    }

    /// How many URLs this session has admitted or ruled out so far.
    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// Filters `candidates` down to fresh, fetchable links, capped at
    /// `max_links`. Admitted URLs are remembered for the rest of the
    /// session; URLs dropped only by the cap are not, so a later iteration
    /// can still pick them up.
    pub async fn filter(
        &mut self,
        candidates: Vec<CandidateLink>,
        max_links: usize,
    ) -> Result<Vec<CandidateLink>, StoreError> {
        let mut fresh: Vec<CandidateLink> = Vec::new();
        let mut in_batch: HashSet<String> = HashSet::new();
        for mut link in candidates {
            let url = normalize_url(&link.url);
            if !is_fetchable_url(&url) {
                debug!(url = %url, "dropping unfetchable candidate");
                continue;
            }
            if self.seen.contains(&url) || !in_batch.insert(url.clone()) {
                continue;
            }
            link.url = url;
            fresh.push(link);
        }

        let urls: Vec<String> = fresh.iter().map(|link| link.url.clone()).collect();
        let mut known: HashSet<String> = HashSet::new();
        for batch in urls.chunks(STORE_BATCH_SIZE) {
            known.extend(self.store.exists(batch).await?);
        }
        // Store hits stay in the seen-set so the next iteration skips the
        // round-trip for them.
        for url in &known {
            self.seen.insert(url.clone());
        }

        let mut admitted: Vec<CandidateLink> = fresh
            .into_iter()
            .filter(|link| !known.contains(&link.url))
            .collect();
        if admitted.len() > max_links {
            debug!(
                dropped = admitted.len() - max_links,
                max_links, "capping candidate links for this iteration"
            );
            admitted.truncate(max_links);
        }
        for link in &admitted {
            self.seen.insert(link.url.clone());
        }

        debug!(
            admitted = admitted.len(),
            already_stored = known.len(),
            seen_total = self.seen.len(),
            "deduplicated candidate links"
        );
        Ok(admitted)
    }
}
