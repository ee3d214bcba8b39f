//! Durable storage for articles and ingestion runs.
//!
//! Two backends implement [`Store`]:
//! - [`memory::MemoryStore`] keeps everything in-process (tests, `memory://`).
//! - [`sqlite::SqliteStore`] persists through an sqlx SQLite pool.
//!
//! Both enforce uniqueness of `canonical_url`; an insert that collides returns
//! [`StoreError::Conflict`], which the pipeline treats as an exact duplicate.
//! Filter semantics live in [`ArticleFilter`] so both backends agree.

pub mod memory;
pub mod sqlite;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{Article, IngestionRun, NewArticle};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("canonical url already stored: {0}")]
    Conflict(String),
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Timeline position `(published_at, id)`; rows strictly after it in
/// descending order are returned.
pub type CursorKey = (DateTime<Utc>, i64);

/// Read-side filters shared by `list` and `count`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArticleFilter {
    /// OR semantics; symbols are expected upper-cased.
    pub tickers: BTreeSet<String>,
    pub provider: Option<String>,
    pub source: Option<String>,
    pub q: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub include_unmapped: bool,
    pub include_unmapped_from_provider: Option<String>,
    /// Return every row of a dedupe group instead of its representative.
    pub include_duplicates: bool,
}

impl ArticleFilter {
    /// Row-level predicate (everything except group collapse and cursor).
    pub fn matches(&self, a: &Article) -> bool {
        if !self.tickers.is_empty() && !a.tickers.iter().any(|t| self.tickers.contains(t)) {
            return false;
        }
        if let Some(p) = &self.provider {
            if a.provider != *p {
                return false;
            }
        }
        if let Some(s) = &self.source {
            if a.source != *s {
                return false;
            }
        }
        if let Some(q) = &self.q {
            // ASCII folding only, like SQLite's lower()
            let needle = q.to_ascii_lowercase();
            let in_title = a.title.to_ascii_lowercase().contains(&needle);
            let in_summary = a
                .summary
                .as_deref()
                .map(|s| s.to_ascii_lowercase().contains(&needle))
                .unwrap_or(false);
            if !in_title && !in_summary {
                return false;
            }
        }
        if let Some(from) = self.from {
            if a.published_at < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if a.published_at > to {
                return false;
            }
        }
        self.visible(a)
    }

    fn visible(&self, a: &Article) -> bool {
        if a.is_mapped() || self.include_unmapped {
            return true;
        }
        match &self.include_unmapped_from_provider {
            Some(p) => a.provider == *p,
            None => false,
        }
    }
}

/// Apply filters, collapse groups to their representative among the matching
/// rows, then order `(published_at DESC, id DESC)`.
///
/// Used by the in-memory backend; the SQL backend expresses the same rules in SQL.
pub fn select_visible<'a, I>(rows: I, filter: &ArticleFilter) -> Vec<&'a Article>
where
    I: IntoIterator<Item = &'a Article>,
{
    let matching = rows.into_iter().filter(|a| filter.matches(a));
    let mut out: Vec<&Article> = if filter.include_duplicates {
        matching.collect()
    } else {
        let mut best: BTreeMap<i64, &Article> = BTreeMap::new();
        for a in matching {
            best.entry(a.dedupe_group)
                .and_modify(|cur| {
                    if a.precedence_key() < cur.precedence_key() {
                        *cur = a;
                    }
                })
                .or_insert(a);
        }
        best.into_values().collect()
    };
    out.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
    out
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn find_by_canonical_url(&self, url: &str) -> Result<Option<Article>, StoreError>;

    /// Articles sharing `title_key` published within `[from, to]`, earliest first.
    async fn find_title_candidates(
        &self,
        title_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Article>, StoreError>;

    async fn insert_article(&self, article: NewArticle) -> Result<Article, StoreError>;

    /// Refresh `last_seen_at` on re-encounter.
    async fn touch_article(&self, id: i64, seen_at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn get_article(&self, id: i64) -> Result<Option<Article>, StoreError>;

    async fn list_articles(
        &self,
        filter: &ArticleFilter,
        after: Option<CursorKey>,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError>;

    async fn count_articles(&self, filter: &ArticleFilter) -> Result<u64, StoreError>;

    /// Every stored canonical url (audit/tests).
    async fn canonical_urls(&self) -> Result<BTreeSet<String>, StoreError>;

    async fn create_run(&self, started_at: DateTime<Utc>) -> Result<IngestionRun, StoreError>;

    async fn finish_run(&self, run: &IngestionRun) -> Result<(), StoreError>;

    /// Most recent runs first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<IngestionRun>, StoreError>;

    /// Close runs left `running` by a previous process. Returns how many were closed.
    async fn fail_stale_runs(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

pub type DynStore = Arc<dyn Store>;

/// Open a store from a connection string:
/// - `memory://` → in-process store
/// - `sqlite:...` → SQLite through sqlx
pub async fn open(database_url: &str) -> anyhow::Result<DynStore> {
    let url = database_url.trim();
    if url.eq_ignore_ascii_case("memory://") || url.eq_ignore_ascii_case("memory") {
        tracing::info!(target: "store", "using in-memory store");
        return Ok(Arc::new(memory::MemoryStore::new()));
    }
    if url.starts_with("sqlite:") {
        ensure_parent_dir(url)?;
        let store = sqlite::SqliteStore::connect(url).await?;
        return Ok(Arc::new(store));
    }
    anyhow::bail!("unsupported DATABASE_URL scheme: {url}")
}

/// SQLite creates the file but not its directory.
fn ensure_parent_dir(url: &str) -> anyhow::Result<()> {
    if url.contains(":memory:") || url.contains("mode=memory") {
        return Ok(());
    }
    let path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or(path);
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| anyhow::anyhow!("creating {}: {e}", parent.display()))?;
        }
    }
    Ok(())
}
