//! Persistent content storage.
//!
//! Accepted evidence is chunked, embedded, and written to a local SQLite
//! database, one table per scenario collection. The store also answers
//! existence queries so the dedup stage can drop URLs that were already
//! researched in an earlier session.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::params_from_iter;
use tracing::debug;

use crate::error::StoreError;
use crate::types::ContentRecord;

// ── Trait ──────────────────────────────────────────────────────────────────

/// Backend for persisted research content.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Returns the subset of `urls` that are already stored.
    async fn exists(&self, urls: &[String]) -> Result<HashSet<String>, StoreError>;

    /// Writes the given records, returning how many rows were inserted.
    async fn write(&self, records: Vec<ContentRecord>) -> Result<usize, StoreError>;
}

// ── SQLite implementation ──────────────────────────────────────────────────

/// SQLite-backed store. One table per collection, so different research
/// scenarios do not pollute each other's dedup horizon.
///
/// Connections are opened per operation inside `spawn_blocking`; SQLite
/// handles are not `Send` and the work is blocking anyway.
pub struct SqliteContentStore {
    db_path: PathBuf,
    collection: String,
}

impl SqliteContentStore {
    /// Opens (creating if needed) the database and ensures the collection
    /// table exists.
    pub fn new(db_path: impl AsRef<Path>, collection: &str) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        let collection = sanitize_collection(collection)?;

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Open {
                    path: db_path.clone(),
                    message: e.to_string(),
                })?;
            }
        }

        let conn = rusqlite::Connection::open(&db_path).map_err(|e| StoreError::Open {
            path: db_path.clone(),
            message: e.to_string(),
        })?;
        init_schema(&conn, &collection).map_err(|e| StoreError::Open {
            path: db_path.clone(),
            message: e.to_string(),
        })?;

        debug!(path = %db_path.display(), collection = %collection, "content store ready");
        Ok(Self {
            db_path,
            collection,
        })
    }

    fn open(&self) -> Result<rusqlite::Connection, StoreError> {
        rusqlite::Connection::open(&self.db_path).map_err(|e| StoreError::Open {
            path: self.db_path.clone(),
            message: e.to_string(),
        })
    }
}

#[async_trait]
impl ContentStore for SqliteContentStore {
    async fn exists(&self, urls: &[String]) -> Result<HashSet<String>, StoreError> {
        if urls.is_empty() {
            return Ok(HashSet::new());
        }

        let db_path = self.db_path.clone();
        let collection = self.collection.clone();
        let urls = urls.to_vec();

        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path).map_err(|e| StoreError::Open {
                path: db_path.clone(),
                message: e.to_string(),
            })?;

            let placeholders = vec!["?"; urls.len()].join(",");
            let sql = format!(
                "SELECT DISTINCT url FROM {collection} WHERE url IN ({placeholders})"
            );
            let mut stmt = conn.prepare(&sql).map_err(|e| StoreError::Query {
                message: e.to_string(),
            })?;
            let rows = stmt
                .query_map(params_from_iter(urls.iter()), |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::Query {
                    message: e.to_string(),
                })?;

            let mut found = HashSet::new();
            for row in rows {
                found.insert(row.map_err(|e| StoreError::Query {
                    message: e.to_string(),
                })?);
            }
            Ok(found)
        })
        .await
        .map_err(|e| StoreError::Query {
            message: format!("store task join error: {e}"),
        })?
    }

    async fn write(&self, records: Vec<ContentRecord>) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let db_path = self.db_path.clone();
        let collection = self.collection.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = rusqlite::Connection::open(&db_path).map_err(|e| StoreError::Open {
                path: db_path.clone(),
                message: e.to_string(),
            })?;

            let tx = conn.transaction().map_err(|e| StoreError::Write {
                message: e.to_string(),
            })?;
            let sql = format!(
                "INSERT OR IGNORE INTO {collection} \
                 (id, url, title, content_chunk, embedding, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            );
            let mut written = 0usize;
            {
                let mut stmt = tx.prepare(&sql).map_err(|e| StoreError::Write {
                    message: e.to_string(),
                })?;
                for record in &records {
                    written += stmt
                        .execute(rusqlite::params![
                            record.id,
                            record.url,
                            record.title,
                            record.content_chunk,
                            embedding_to_blob(&record.embedding),
                            record.created_at,
                        ])
                        .map_err(|e| StoreError::Write {
                            message: e.to_string(),
                        })?;
                }
            }
            tx.commit().map_err(|e| StoreError::Write {
                message: e.to_string(),
            })?;
            Ok(written)
        })
        .await
        .map_err(|e| StoreError::Write {
            message: format!("store task join error: {e}"),
        })?
    }
}

fn init_schema(conn: &rusqlite::Connection, collection: &str) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "CREATE TABLE IF NOT EXISTS {collection} (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                title TEXT NOT NULL,
                content_chunk TEXT NOT NULL,
                embedding BLOB NOT NULL,
                created_at INTEGER NOT NULL
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!("CREATE INDEX IF NOT EXISTS idx_{collection}_url ON {collection} (url)"),
        [],
    )?;
    Ok(())
}

/// Collection names become table names, so only identifier characters pass.
fn sanitize_collection(name: &str) -> Result<String, StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(name.to_string())
    } else {
        Err(StoreError::Query {
            message: format!("invalid collection name: {name:?}"),
        })
    }
}

fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

#[allow(dead_code)]
fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ── Mock implementation ────────────────────────────────────────────────────

/// In-memory store for tests. Records URLs it has seen, keeps written
/// records for inspection, and can be told to fail writes.
#[derive(Default)]
pub struct MockContentStore {
    urls: Mutex<HashSet<String>>,
    records: Mutex<Vec<ContentRecord>>,
    exists_batches: Mutex<Vec<usize>>,
    write_batches: Mutex<Vec<usize>>,
    fail_writes: Mutex<bool>,
}

impl MockContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds the store with already-known URLs.
    pub fn with_existing(urls: &[&str]) -> Self {
        let store = Self::new();
        {
            let mut set = store.urls.lock().unwrap();
            for url in urls {
                set.insert((*url).to_string());
            }
        }
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.lock().unwrap() = fail;
    }

    pub fn written(&self) -> Vec<ContentRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Sizes of each `exists` batch received, in call order.
    pub fn exists_batch_sizes(&self) -> Vec<usize> {
        self.exists_batches.lock().unwrap().clone()
    }

    /// Sizes of each `write` batch received, in call order.
    pub fn write_batch_sizes(&self) -> Vec<usize> {
        self.write_batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContentStore for MockContentStore {
    async fn exists(&self, urls: &[String]) -> Result<HashSet<String>, StoreError> {
        self.exists_batches.lock().unwrap().push(urls.len());
        let known = self.urls.lock().unwrap();
        Ok(urls
            .iter()
            .filter(|url| known.contains(*url))
            .cloned()
            .collect())
    }

    async fn write(&self, records: Vec<ContentRecord>) -> Result<usize, StoreError> {
        self.write_batches.lock().unwrap().push(records.len());
        if *self.fail_writes.lock().unwrap() {
            return Err(StoreError::Write {
                message: "mock write failure".to_string(),
            });
        }
        let count = records.len();
        {
            let mut known = self.urls.lock().unwrap();
            for record in &records {
                known.insert(record.url.clone());
            }
        }
        self.records.lock().unwrap().extend(records);
        Ok(count)
    }
}
