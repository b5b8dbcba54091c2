//! SQLite-backed cache of raw model codings.
//!
//! Only the raw response text is stored. Extraction is re-run on every hit,
//! so tightening the extractor never requires invalidating the cache.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::Serialize;

pub const CACHE_PATH_ENV: &str = "QUALCODE_CACHE_PATH";

/// Identity of one (model, prompt, protocol, codebook, item) coding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodingCacheKey {
    pub model: String,
    pub template_slug: String,
    pub template_hash: String,
    pub protocol_hash: String,
    pub codebook_hash: String,
    pub item_hash: String,
    pub key_hash: String,
}

impl CodingCacheKey {
    pub fn new(
        model: &str,
        template_slug: &str,
        template_hash: &str,
        protocol_text: &str,
        codebook_text: &str,
        item_hash: &str,
    ) -> Self {
        let protocol_hash = hash_text(protocol_text);
        let codebook_hash = hash_text(codebook_text);
        let key_hash = hash_fields(&[
            model,
            template_slug,
            template_hash,
            &protocol_hash,
            &codebook_hash,
            item_hash,
        ]);

        Self {
            model: model.to_string(),
            template_slug: template_slug.to_string(),
            template_hash: template_hash.to_string(),
            protocol_hash,
            codebook_hash,
            item_hash: item_hash.to_string(),
            key_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCoding {
    pub raw_response: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub cost_nanodollars: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait CodingCache: Send + Sync {
    async fn get(&self, key: &CodingCacheKey) -> Result<Option<CachedCoding>, CacheError>;
    async fn put(&self, key: &CodingCacheKey, value: &CachedCoding) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteCodingCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCodingCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; \
             PRAGMA synchronous=NORMAL; \
             CREATE TABLE IF NOT EXISTS coding_cache ( \
               key_hash TEXT PRIMARY KEY, \
               model TEXT NOT NULL, \
               template_slug TEXT NOT NULL, \
               template_hash TEXT NOT NULL, \
               protocol_hash TEXT NOT NULL, \
               codebook_hash TEXT NOT NULL, \
               item_hash TEXT NOT NULL, \
               raw_response TEXT NOT NULL, \
               input_tokens INTEGER, \
               output_tokens INTEGER, \
               cost_nanodollars INTEGER, \
               created_at INTEGER NOT NULL, \
               updated_at INTEGER NOT NULL, \
               hit_count INTEGER NOT NULL DEFAULT 0 \
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CACHE_PATH_ENV) {
            return PathBuf::from(path);
        }
        PathBuf::from(".qualcode_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.with_conn(f))
            .await
            .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[async_trait]
impl CodingCache for SqliteCodingCache {
    async fn get(&self, key: &CodingCacheKey) -> Result<Option<CachedCoding>, CacheError> {
        let key_hash = key.key_hash.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT raw_response, input_tokens, output_tokens, cost_nanodollars \
                 FROM coding_cache WHERE key_hash = ?1",
            )?;
            let mut rows = stmt.query(params![key_hash])?;
            let Some(row) = rows.next()? else {
                return Ok(None);
            };
            let entry = CachedCoding {
                raw_response: row.get(0)?,
                input_tokens: row.get::<_, Option<i64>>(1)?.map(|v| v as u32),
                output_tokens: row.get::<_, Option<i64>>(2)?.map(|v| v as u32),
                cost_nanodollars: row.get(3)?,
            };
            conn.execute(
                "UPDATE coding_cache \
                 SET hit_count = hit_count + 1, updated_at = ?1 \
                 WHERE key_hash = ?2",
                params![now_epoch(), key_hash],
            )?;
            Ok(Some(entry))
        })
        .await
    }

    async fn put(&self, key: &CodingCacheKey, value: &CachedCoding) -> Result<(), CacheError> {
        let key = key.clone();
        let value = value.clone();
        self.blocking(move |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO coding_cache ( \
                    key_hash, model, template_slug, template_hash, protocol_hash, codebook_hash, \
                    item_hash, raw_response, input_tokens, output_tokens, cost_nanodollars, \
                    created_at, updated_at \
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13) \
                 ON CONFLICT(key_hash) DO UPDATE SET \
                    raw_response = excluded.raw_response, \
                    input_tokens = excluded.input_tokens, \
                    output_tokens = excluded.output_tokens, \
                    cost_nanodollars = excluded.cost_nanodollars, \
                    updated_at = excluded.updated_at",
                params![
                    key.key_hash,
                    key.model,
                    key.template_slug,
                    key.template_hash,
                    key.protocol_hash,
                    key.codebook_hash,
                    key.item_hash,
                    value.raw_response,
                    value.input_tokens.map(|v| v as i64),
                    value.output_tokens.map(|v| v as i64),
                    value.cost_nanodollars,
                    now,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

/// Cross-process advisory lock held next to the database file.
#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub model: String,
    pub template_slug: String,
    pub template_hash: String,
    pub protocol_hash: String,
    pub codebook_hash: String,
    pub item_hash: String,
    pub raw_response: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub cost_nanodollars: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteCodingCache {
    /// Write every row as one JSON object per line, most recent first.
    /// Returns the number of rows written.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key_hash, model, template_slug, template_hash, protocol_hash, codebook_hash, \
                        item_hash, raw_response, input_tokens, output_tokens, cost_nanodollars, \
                        created_at, updated_at, hit_count \
                 FROM coding_cache ORDER BY updated_at DESC",
            )?;
            let mut rows = stmt.query([])?;
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let mut written = 0usize;
            while let Some(row) = rows.next()? {
                let record = CacheExportRow {
                    key_hash: row.get(0)?,
                    model: row.get(1)?,
                    template_slug: row.get(2)?,
                    template_hash: row.get(3)?,
                    protocol_hash: row.get(4)?,
                    codebook_hash: row.get(5)?,
                    item_hash: row.get(6)?,
                    raw_response: row.get(7)?,
                    input_tokens: row.get::<_, Option<i64>>(8)?.map(|v| v as u32),
                    output_tokens: row.get::<_, Option<i64>>(9)?.map(|v| v as u32),
                    cost_nanodollars: row.get(10)?,
                    created_at: row.get(11)?,
                    updated_at: row.get(12)?,
                    hit_count: row.get(13)?,
                };
                writeln!(file, "{}", serde_json::to_string(&record)?)?;
                written += 1;
            }
            file.flush()?;
            Ok(written)
        })
        .await
    }

    /// Drop rows not touched within `max_age_days`, then keep at most
    /// `max_rows` of the most recently used.
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        self.blocking(move |conn| {
            let mut deleted: usize = 0;
            if let Some(days) = max_age_days {
                let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                deleted += conn.execute(
                    "DELETE FROM coding_cache WHERE updated_at < ?1",
                    params![cutoff],
                )?;
            }

            if let Some(max_rows) = max_rows {
                deleted += conn.execute(
                    "DELETE FROM coding_cache WHERE key_hash IN ( \
                        SELECT key_hash FROM coding_cache \
                        ORDER BY updated_at DESC LIMIT -1 OFFSET ?1 \
                     )",
                    params![max_rows as i64],
                )?;
            }

            let remaining: i64 =
                conn.query_row("SELECT COUNT(*) FROM coding_cache", [], |row| row.get(0))?;
            Ok(CachePruneStats {
                deleted,
                remaining: remaining.max(0) as usize,
            })
        })
        .await
    }
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
