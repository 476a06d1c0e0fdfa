//! Persistence sink for accepted evidence.
//!
//! Chunks content, embeds each chunk, and writes the resulting records in
//! small batches. Store failures are logged and skipped; persistence never
//! fails a research session.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::embeddings::Embedder;
use crate::store::ContentStore;
use crate::types::{ContentRecord, EvidenceItem};

/// Maximum characters per stored chunk.
pub const CHUNK_CHARS: usize = 10_000;
/// Records per write batch.
pub const WRITE_BATCH_SIZE: usize = 5;

pub struct PersistenceSink {
    store: Arc<dyn ContentStore>,
    embedder: Arc<dyn Embedder>,
}

impl PersistenceSink {
    pub fn new(store: Arc<dyn ContentStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self { store, embedder }
    }

    /// Persists `items`, returning the number of records written.
    ///
    /// URLs already in the store are skipped; concurrent sessions may have
    /// written them between the dedup check and now, so the re-check keeps
    /// writes idempotent by URL.
    pub async fn persist(&self, items: &[EvidenceItem]) -> usize {
        if items.is_empty() {
            return 0;
        }

        let urls: Vec<String> = items.iter().map(|item| item.url.clone()).collect();
        let known: HashSet<String> = match self.store.exists(&urls).await {
            Ok(known) => known,
            Err(e) => {
                warn!(error = %e, "pre-write existence check failed; writing anyway");
                HashSet::new()
            }
        };

        let mut records: Vec<ContentRecord> = Vec::new();
        for item in items {
            if known.contains(&item.url) {
                debug!(url = %item.url, "already stored, skipping");
                continue;
            }
            for chunk in chunk_text(&item.content, CHUNK_CHARS) {
                let embedding = self.embedder.embed(&chunk);
                records.push(ContentRecord::new(&item.url, &item.title, chunk, embedding));
            }
        }

        let mut written = 0usize;
        for batch in records.chunks(WRITE_BATCH_SIZE) {
            match self.store.write(batch.to_vec()).await {
                Ok(count) => written += count,
                Err(e) => warn!(error = %e, batch = batch.len(), "write batch failed, skipping"),
            }
        }

        debug!(items = items.len(), written, "persisted evidence");
        written
    }
}

/// Splits `text` into chunks of at most `max_chars` characters, on char
/// boundaries. Empty input yields no chunks.
fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut count = 0usize;
    for c in text.chars() {
        current.push(c);
        count += 1;
        if count == max_chars {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
