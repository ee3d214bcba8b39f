// src/query.rs
//! Read path: filter parsing, cursor pagination and counts over the store.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::config::parse_bool;
use crate::model::Article;
use crate::store::{ArticleFilter, CursorKey, DynStore, StoreError};

pub const DEFAULT_LIMIT: usize = 50;
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid cursor")]
    InvalidCursor,
    #[error("invalid date for `{0}`: expected RFC 3339 or YYYY-MM-DD")]
    InvalidDate(&'static str),
    #[error("`from` must not be after `to`")]
    InvalidRange,
    #[error("`limit` must be an integer between 1 and 100")]
    InvalidLimit,
    #[error("`{0}` must be true or false")]
    InvalidFlag(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl QueryError {
    pub fn is_client_error(&self) -> bool {
        !matches!(self, QueryError::Store(_))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorPayload {
    published_at: DateTime<Utc>,
    id: i64,
}

pub fn encode_cursor(published_at: DateTime<Utc>, id: i64) -> String {
    // serializing two plain fields cannot fail
    let json = serde_json::to_vec(&CursorPayload { published_at, id }).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(json)
}

pub fn decode_cursor(cursor: &str) -> Result<CursorKey, QueryError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(cursor.trim().trim_end_matches('='))
        .map_err(|_| QueryError::InvalidCursor)?;
    let p: CursorPayload = serde_json::from_slice(&bytes).map_err(|_| QueryError::InvalidCursor)?;
    Ok((p.published_at, p.id))
}

/// Raw `/news` query-string parameters. Everything is a string so that
/// validation errors come back as JSON rather than extractor rejections.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewsParams {
    pub ticker: Option<String>,
    pub provider: Option<String>,
    pub source: Option<String>,
    pub q: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub include_unmapped: Option<String>,
    pub include_unmapped_from_provider: Option<String>,
    pub include_duplicates: Option<String>,
    pub cursor: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewsQuery {
    pub filter: ArticleFilter,
    pub cursor: Option<CursorKey>,
    pub limit: usize,
}

fn text(v: &Option<String>) -> Option<String> {
    v.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn flag(v: &Option<String>, name: &'static str) -> Result<bool, QueryError> {
    match text(v) {
        None => Ok(false),
        Some(s) => parse_bool(&s).ok_or(QueryError::InvalidFlag(name)),
    }
}

/// `YYYY-MM-DD` bounds expand to the whole day (start for `from`, end for `to`).
fn bound(v: &Option<String>, name: &'static str, end_of_day: bool) -> Result<Option<DateTime<Utc>>, QueryError> {
    let Some(s) = text(v) else {
        return Ok(None);
    };
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }
    let day = NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|_| QueryError::InvalidDate(name))?;
    let t = if end_of_day {
        day.and_hms_micro_opt(23, 59, 59, 999_999)
    } else {
        day.and_hms_opt(0, 0, 0)
    };
    t.map(|n| Some(n.and_utc())).ok_or(QueryError::InvalidDate(name))
}

impl NewsParams {
    /// Validate into a query. `default_unmapped_provider` applies when the
    /// request does not name one.
    pub fn into_query(self, default_unmapped_provider: Option<&str>) -> Result<NewsQuery, QueryError> {
        let tickers: BTreeSet<String> = text(&self.ticker)
            .map(|t| {
                t.split(',')
                    .map(|s| s.trim().to_ascii_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let from = bound(&self.from, "from", false)?;
        let to = bound(&self.to, "to", true)?;
        if let (Some(f), Some(t)) = (from, to) {
            if f > t {
                return Err(QueryError::InvalidRange);
            }
        }

        let limit = match text(&self.limit) {
            None => DEFAULT_LIMIT,
            Some(s) => match s.parse::<usize>() {
                Ok(n) if (1..=MAX_LIMIT).contains(&n) => n,
                _ => return Err(QueryError::InvalidLimit),
            },
        };
        let cursor = text(&self.cursor).map(|c| decode_cursor(&c)).transpose()?;

        Ok(NewsQuery {
            filter: ArticleFilter {
                tickers,
                provider: text(&self.provider),
                source: text(&self.source),
                q: text(&self.q),
                from,
                to,
                include_unmapped: flag(&self.include_unmapped, "include_unmapped")?,
                include_unmapped_from_provider: text(&self.include_unmapped_from_provider)
                    .or_else(|| default_unmapped_provider.map(str::to_string)),
                include_duplicates: flag(&self.include_duplicates, "include_duplicates")?,
            },
            cursor,
            limit,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub items: Vec<Article>,
    pub next_cursor: Option<String>,
}

#[derive(Clone)]
pub struct QueryService {
    store: DynStore,
    default_unmapped_provider: Option<String>,
}

impl QueryService {
    pub fn new(store: DynStore, default_unmapped_provider: Option<String>) -> Self {
        Self {
            store,
            default_unmapped_provider,
        }
    }

    pub fn parse(&self, params: NewsParams) -> Result<NewsQuery, QueryError> {
        params.into_query(self.default_unmapped_provider.as_deref())
    }

    /// One page in `(published_at DESC, id DESC)` order. `next_cursor` is set
    /// only when more rows follow.
    pub async fn list(&self, query: &NewsQuery) -> Result<Page, QueryError> {
        let mut items = self
            .store
            .list_articles(&query.filter, query.cursor, query.limit + 1)
            .await?;
        let more = items.len() > query.limit;
        items.truncate(query.limit);
        let next_cursor = if more {
            items.last().map(|a| encode_cursor(a.published_at, a.id))
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    pub async fn count(&self, filter: &ArticleFilter) -> Result<u64, QueryError> {
        Ok(self.store.count_articles(filter).await?)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Article>, QueryError> {
        Ok(self.store.get_article(id).await?)
    }
}
