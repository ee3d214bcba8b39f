// src/store/memory.rs
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{select_visible, ArticleFilter, CursorKey, Store, StoreError};
use crate::model::{Article, IngestionRun, NewArticle, RunStatus};

#[derive(Debug, Default)]
struct Inner {
    articles: BTreeMap<i64, Article>,
    by_url: HashMap<String, i64>,
    runs: BTreeMap<i64, IngestionRun>,
    next_article_id: i64,
    next_run_id: i64,
}

/// In-process store. Ids are assigned sequentially from 1.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_writes: AtomicBool,
    failing_run_finishes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: make every article write fail with `StoreError::Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Test helper: fail the next `n` `finish_run` calls.
    pub fn fail_next_run_finishes(&self, n: usize) {
        self.failing_run_finishes.store(n, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("writes disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_by_canonical_url(&self, url: &str) -> Result<Option<Article>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .by_url
            .get(url)
            .and_then(|id| inner.articles.get(id))
            .cloned())
    }

    async fn find_title_candidates(
        &self,
        title_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Article>, StoreError> {
        let inner = self.inner.read().await;
        let mut out: Vec<Article> = inner
            .articles
            .values()
            .filter(|a| a.title_key == title_key && a.published_at >= from && a.published_at <= to)
            .cloned()
            .collect();
        out.sort_by_key(|a| a.precedence_key());
        Ok(out)
    }

    async fn insert_article(&self, article: NewArticle) -> Result<Article, StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        if inner.by_url.contains_key(&article.canonical_url) {
            return Err(StoreError::Conflict(article.canonical_url));
        }
        inner.next_article_id += 1;
        let id = inner.next_article_id;
        let stored = article.into_article(id);
        inner.by_url.insert(stored.canonical_url.clone(), id);
        inner.articles.insert(id, stored.clone());
        Ok(stored)
    }

    async fn touch_article(&self, id: i64, seen_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let article = inner
            .articles
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("article {id}")))?;
        if seen_at > article.last_seen_at {
            article.last_seen_at = seen_at;
        }
        Ok(())
    }

    async fn get_article(&self, id: i64) -> Result<Option<Article>, StoreError> {
        Ok(self.inner.read().await.articles.get(&id).cloned())
    }

    async fn list_articles(
        &self,
        filter: &ArticleFilter,
        after: Option<CursorKey>,
        limit: usize,
    ) -> Result<Vec<Article>, StoreError> {
        let inner = self.inner.read().await;
        Ok(select_visible(inner.articles.values(), filter)
            .into_iter()
            .filter(|a| after.map(|c| a.order_key() < c).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_articles(&self, filter: &ArticleFilter) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok(select_visible(inner.articles.values(), filter).len() as u64)
    }

    async fn canonical_urls(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.inner.read().await.by_url.keys().cloned().collect())
    }

    async fn create_run(&self, started_at: DateTime<Utc>) -> Result<IngestionRun, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_run_id += 1;
        let run = IngestionRun::started(inner.next_run_id, started_at);
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn finish_run(&self, run: &IngestionRun) -> Result<(), StoreError> {
        let failing = self
            .failing_run_finishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(StoreError::Unavailable("run write failed".into()));
        }
        let mut inner = self.inner.write().await;
        match inner.runs.get_mut(&run.id) {
            Some(slot) => {
                *slot = run.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("run {}", run.id))),
        }
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<IngestionRun>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.runs.values().rev().take(limit).cloned().collect())
    }

    async fn fail_stale_runs(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut closed = 0;
        for run in inner.runs.values_mut() {
            if run.status == RunStatus::Running {
                run.status = RunStatus::Failed;
                run.finished_at = Some(now);
                run.error = Some("interrupted before completion".into());
                closed += 1;
            }
        }
        Ok(closed)
    }
}
