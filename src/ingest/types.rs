// src/ingest/types.rs
use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::NewArticle;

/// Wire format of a feed; selects the adapter that parses it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedFormat {
    #[default]
    Rss,
    Atom,
}

/// One fetchable feed, as resolved for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Stable identifier, also the key in `per_source_stats`.
    pub id: String,
    /// Human label, e.g. "PR Newswire".
    pub provider: String,
    pub url: String,
    #[serde(default)]
    pub format: FeedFormat,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Overrides the global request timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Symbols the feed is scoped to (per-symbol feeds only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context_symbols: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Fields pulled out of a feed entry before any cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEntry {
    pub title: Option<String>,
    pub link: Option<String>,
    pub guid: Option<String>,
    pub published: Option<String>,
    pub summary: Option<String>,
    /// Originating wire named inside an aggregator item (RSS `<source>`).
    pub origin: Option<String>,
}

/// A normalized entry, ready for dedup and ticker mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArticleDraft {
    pub title: String,
    pub title_key: String,
    pub canonical_url: String,
    pub raw_url: String,
    pub provider: String,
    pub source: String,
    pub guid: Option<String>,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub published_at_estimated: bool,
    pub fetched_at: DateTime<Utc>,
    pub context_symbols: Vec<String>,
}

impl ArticleDraft {
    pub fn into_new_article(self, tickers: BTreeSet<String>, dedupe_group: Option<i64>) -> NewArticle {
        NewArticle {
            title: self.title,
            title_key: self.title_key,
            canonical_url: self.canonical_url,
            raw_url: self.raw_url,
            provider: self.provider,
            source: self.source,
            guid: self.guid,
            summary: self.summary,
            published_at: self.published_at,
            published_at_estimated: self.published_at_estimated,
            fetched_at: self.fetched_at,
            tickers,
            dedupe_group,
        }
    }
}
