// src/store/sqlite.rs
//! SQLite backend. Timestamps are stored as integer microseconds since the
//! epoch so range comparisons and ordering stay exact in SQL.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, QueryBuilder, Sqlite};
use tracing::info;

use super::{ArticleFilter, CursorKey, Store, StoreError};
use crate::model::{Article, IngestionRun, NewArticle, RunStatus, SourceStats};

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS articles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        title_key TEXT NOT NULL,
        canonical_url TEXT NOT NULL UNIQUE,
        raw_url TEXT NOT NULL,
        provider TEXT NOT NULL,
        source TEXT NOT NULL,
        guid TEXT,
        summary TEXT,
        published_at_us INTEGER NOT NULL,
        published_at_estimated INTEGER NOT NULL DEFAULT 0,
        fetched_at_us INTEGER NOT NULL,
        last_seen_at_us INTEGER NOT NULL,
        dedupe_group INTEGER
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_articles_timeline ON articles (published_at_us DESC, id DESC)",
    "CREATE INDEX IF NOT EXISTS idx_articles_title_key ON articles (title_key, published_at_us)",
    "CREATE INDEX IF NOT EXISTS idx_articles_group ON articles (dedupe_group)",
    r#"CREATE TABLE IF NOT EXISTS article_tickers (
        article_id INTEGER NOT NULL REFERENCES articles(id),
        symbol TEXT NOT NULL,
        PRIMARY KEY (article_id, symbol)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_article_tickers_symbol ON article_tickers (symbol)",
    r#"CREATE TABLE IF NOT EXISTS ingestion_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        started_at_us INTEGER NOT NULL,
        finished_at_us INTEGER,
        status TEXT NOT NULL,
        per_source_stats TEXT NOT NULL DEFAULT '{}',
        error TEXT
    )"#,
];

#[derive(Debug, sqlx::FromRow)]
struct ArticleRow {
    id: i64,
    title: String,
    title_key: String,
    canonical_url: String,
    raw_url: String,
    provider: String,
    source: String,
    guid: Option<String>,
    summary: Option<String>,
    published_at_us: i64,
    published_at_estimated: bool,
    fetched_at_us: i64,
    last_seen_at_us: i64,
    dedupe_group: Option<i64>,
}

impl ArticleRow {
    fn into_article(self, tickers: BTreeSet<String>) -> Article {
        Article {
            id: self.id,
            title: self.title,
            canonical_url: self.canonical_url,
            raw_url: self.raw_url,
            provider: self.provider,
            source: self.source,
            guid: self.guid,
            summary: self.summary,
            published_at: from_micros(self.published_at_us),
            published_at_estimated: self.published_at_estimated,
            fetched_at: from_micros(self.fetched_at_us),
            last_seen_at: from_micros(self.last_seen_at_us),
            tickers,
            dedupe_group: self.dedupe_group.unwrap_or(self.id),
            title_key: self.title_key,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: i64,
    started_at_us: i64,
    finished_at_us: Option<i64>,
    status: String,
    per_source_stats: String,
    error: Option<String>,
}

impl RunRow {
    fn into_run(self) -> Result<IngestionRun, StoreError> {
        let per_source_stats: BTreeMap<String, SourceStats> =
            serde_json::from_str(&self.per_source_stats)?;
        Ok(IngestionRun {
            id: self.id,
            started_at: from_micros(self.started_at_us),
            finished_at: self.finished_at_us.map(from_micros),
            status: RunStatus::parse(&self.status).unwrap_or(RunStatus::Failed),
            per_source_stats,
            error: self.error,
        })
    }
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(us: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(us).single().unwrap_or_default()
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Connect and ensure the schema exists. `sqlite::memory:` keeps a single
    /// long-lived connection so the database survives between queries.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        info!(target: "store", url = database_url, "opening sqlite store");
        let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .synchronous(SqliteSynchronous::Normal);
        let options = if in_memory {
            options
        } else {
            options.journal_mode(SqliteJournalMode::Wal)
        };

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };
        let pool = pool_options.connect_with(options).await?;

        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        // databases created before entry ids were kept
        let has_guid: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('articles') WHERE name = 'guid'",
        )
        .fetch_one(&pool)
        .await?;
        if !has_guid {
            sqlx::query("ALTER TABLE articles ADD COLUMN guid TEXT")
                .execute(&pool)
                .await?;
        }
        info!(target: "store", "schema ensured");
        Ok(Self { pool })
    }

    async fn load_tickers(
        &self,
        ids: &[i64],
    ) -> Result<BTreeMap<i64, BTreeSet<String>>, StoreError> {
        let mut out: BTreeMap<i64, BTreeSet<String>> = BTreeMap::new();
        if ids.is_empty() {
            return Ok(out);
        }
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT article_id, symbol FROM article_tickers WHERE article_id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(*id);
        }
        sep.push_unseparated(") ORDER BY article_id, symbol");
        let rows: Vec<(i64, String)> = qb.build_query_as().fetch_all(&self.pool).await?;
        for (id, symbol) in rows {
            out.entry(id).or_default().insert(symbol);
        }
        Ok(out)
    }

    async fn hydrate(&self, rows: Vec<ArticleRow>) -> Result<Vec<Article>, StoreError> {
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut tickers = self.load_tickers(&ids).await?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let t = tickers.remove(&r.id).unwrap_or_default();
                r.into_article(t)
            })
            .collect())
    }
}

/// Append the row-level filter for table alias `alias` (mirrors `ArticleFilter::matches`).
fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, alias: &str, f: &ArticleFilter) {
    if !f.tickers.is_empty() {
        qb.push(format!(
            " AND EXISTS (SELECT 1 FROM article_tickers t_{alias} WHERE t_{alias}.article_id = {alias}.id AND t_{alias}.symbol IN ("
        ));
        let mut sep = qb.separated(", ");
        for t in &f.tickers {
            sep.push_bind(t.clone());
        }
        sep.push_unseparated("))");
    }
    if let Some(p) = &f.provider {
        qb.push(format!(" AND {alias}.provider = "))
            .push_bind(p.clone());
    }
    if let Some(s) = &f.source {
        qb.push(format!(" AND {alias}.source = "))
            .push_bind(s.clone());
    }
    if let Some(q) = &f.q {
        qb.push(format!(" AND (instr(lower({alias}.title), lower("))
            .push_bind(q.clone())
            .push(format!(")) > 0 OR instr(lower(coalesce({alias}.summary, '')), lower("))
            .push_bind(q.clone())
            .push(")) > 0)");
    }
    if let Some(from) = f.from {
        qb.push(format!(" AND {alias}.published_at_us >= "))
            .push_bind(to_micros(from));
    }
    if let Some(to) = f.to {
        qb.push(format!(" AND {alias}.published_at_us <= "))
            .push_bind(to_micros(to));
    }
    if !f.include_unmapped {
        qb.push(format!(
            " AND (EXISTS (SELECT 1 FROM article_tickers m_{alias} WHERE m_{alias}.article_id = {alias}.id)"
        ));
        if let Some(p) = &f.include_unmapped_from_provider {
            qb.push(format!(" OR {alias}.provider = "))
                .push_bind(p.clone());
        }
        qb.push(")");
    }
}

/// Append the group-collapse clause: no other filtered member of the same group precedes `a`.
fn push_collapse(qb: &mut QueryBuilder<'_, Sqlite>, f: &ArticleFilter) {
    if f.include_duplicates {
        return;
    }
    qb.push(" AND NOT EXISTS (SELECT 1 FROM articles b WHERE b.dedupe_group = a.dedupe_group AND b.id <> a.id");
    push_filters(qb, "b", f);
    qb.push(
        " AND (b.published_at_us < a.published_at_us OR (b.published_at_us = a.published_at_us \
         AND (b.fetched_at_us < a.fetched_at_us OR (b.fetched_at_us = a.fetched_at_us AND b.id < a.id)))))",
    );
}

#[async_trait]
impl Store for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn find_by_canonical_url(&self, url: &str) -> Result<Option<Article>, StoreError> {
        let row: Option<ArticleRow> =
            sqlx::query_as("SELECT * FROM articles WHERE canonical_url = ?1")
                .bind(url)
                .fetch_optional(&self.pool)
                .await?;
        match row {
            Some(r) => Ok(self.hydrate(vec![r]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn find_title_candidates(
        &self,
        title_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Article>, StoreError> {
        let rows: Vec<ArticleRow> = sqlx::query_as(
            "SELECT * FROM articles WHERE title_key = ?1 AND published_at_us BETWEEN ?2 AND ?3 \
             ORDER BY published_at_us, fetched_at_us, id LIMIT 50",
        )
        .bind(title_key)
        .bind(to_micros(from))
        .bind(to_micros(to))
        .fetch_all(&self.pool)
        .await?;
        self.hydrate(rows).await
    }

    async fn insert_article(&self, article: NewArticle) -> Result<Article, StoreError> {
        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            "INSERT INTO articles (title, title_key, canonical_url, raw_url, provider, source, summary, \
             published_at_us, published_at_estimated, fetched_at_us, last_seen_at_us, dedupe_group, guid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10, ?11, ?12)",
        )
        .bind(&article.title)
        .bind(&article.title_key)
        .bind(&article.canonical_url)
        .bind(&article.raw_url)
        .bind(&article.provider)
        .bind(&article.source)
        .bind(&article.summary)
        .bind(to_micros(article.published_at))
        .bind(article.published_at_estimated)
        .bind(to_micros(article.fetched_at))
        .bind(article.dedupe_group)
        .bind(&article.guid)
        .execute(&mut *tx)
        .await;

        let id = match inserted {
            Ok(res) => res.last_insert_rowid(),
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::Conflict(article.canonical_url));
            }
            Err(e) => return Err(e.into()),
        };

        if article.dedupe_group.is_none() {
            sqlx::query("UPDATE articles SET dedupe_group = ?1 WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        for symbol in &article.tickers {
            sqlx::query("INSERT OR IGNORE INTO article_tickers (article_id, symbol) VALUES (?1, ?2)")
                .bind(id)
                .bind(symbol)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(article.into_article(id))
    }

    async fn touch_article(&self, id: i64, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE articles SET last_seen_at_us = max(last_seen_at_us, ?1) WHERE id = ?2")
            .bind(to_micros(seen_at))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_article(&self, id: i64) -> Result<Option<Article>, StoreError> {
        let row: Option<ArticleRow> = sqlx::query_as("SELECT * FROM articles WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => Ok(self.hydrate(vec![r]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list_articles(
        &self,
        filter: &ArticleFilter,
        after: Option<CursorKey>,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT a.* FROM articles a WHERE 1 = 1");
        push_filters(&mut qb, "a", filter);
        push_collapse(&mut qb, filter);
        if let Some((published_at, id)) = after {
            let p = to_micros(published_at);
            qb.push(" AND (a.published_at_us < ")
                .push_bind(p)
                .push(" OR (a.published_at_us = ")
                .push_bind(p)
                .push(" AND a.id < ")
                .push_bind(id)
                .push("))");
        }
        qb.push(" ORDER BY a.published_at_us DESC, a.id DESC LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<ArticleRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        self.hydrate(rows).await
    }

    async fn count_articles(&self, filter: &ArticleFilter) -> Result<u64, StoreError> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM articles a WHERE 1 = 1");
        push_filters(&mut qb, "a", filter);
        push_collapse(&mut qb, filter);
        let total: i64 = qb.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(total.max(0) as u64)
    }

    async fn canonical_urls(&self) -> Result<BTreeSet<String>, StoreError> {
        let urls: Vec<String> = sqlx::query_scalar("SELECT canonical_url FROM articles")
            .fetch_all(&self.pool)
            .await?;
        Ok(urls.into_iter().collect())
    }

    async fn create_run(&self, started_at: DateTime<Utc>) -> Result<IngestionRun, StoreError> {
        let res = sqlx::query(
            "INSERT INTO ingestion_runs (started_at_us, status, per_source_stats) VALUES (?1, ?2, '{}')",
        )
        .bind(to_micros(started_at))
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(IngestionRun::started(res.last_insert_rowid(), started_at))
    }

    async fn finish_run(&self, run: &IngestionRun) -> Result<(), StoreError> {
        let stats = serde_json::to_string(&run.per_source_stats)?;
        let res = sqlx::query(
            "UPDATE ingestion_runs SET finished_at_us = ?1, status = ?2, per_source_stats = ?3, error = ?4 WHERE id = ?5",
        )
        .bind(run.finished_at.map(to_micros))
        .bind(run.status.as_str())
        .bind(stats)
        .bind(&run.error)
        .bind(run.id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("run {}", run.id)));
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<IngestionRun>, StoreError> {
        let rows: Vec<RunRow> = sqlx::query_as("SELECT * FROM ingestion_runs ORDER BY id DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(RunRow::into_run).collect()
    }

    async fn fail_stale_runs(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let res = sqlx::query(
            "UPDATE ingestion_runs SET status = ?1, finished_at_us = ?2, error = 'interrupted before completion' \
             WHERE status = ?3",
        )
        .bind(RunStatus::Failed.as_str())
        .bind(to_micros(now))
        .bind(RunStatus::Running.as_str())
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}
