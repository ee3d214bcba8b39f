//! Stored entities shared by the ingestion pipeline, the store and the API.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single stored story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub title: String,
    #[serde(rename = "url")]
    pub canonical_url: String,
    pub raw_url: String,
    pub provider: String,
    pub source: String,
    /// Feed-assigned entry id, kept for provenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    /// True when the feed date could not be parsed and fetch time was used instead.
    pub published_at_estimated: bool,
    pub fetched_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub tickers: BTreeSet<String>,
    pub dedupe_group: i64,
    #[serde(skip)]
    pub title_key: String,
}

impl Article {
    pub fn is_mapped(&self) -> bool {
        !self.tickers.is_empty()
    }

    /// Key used to pick a group's representative: earliest wins.
    pub fn precedence_key(&self) -> (DateTime<Utc>, DateTime<Utc>, i64) {
        (self.published_at, self.fetched_at, self.id)
    }

    /// Key used for timeline ordering and cursors (sorted descending).
    pub fn order_key(&self) -> (DateTime<Utc>, i64) {
        (self.published_at, self.id)
    }
}

/// Insert payload; the store assigns `id` and, when `dedupe_group` is `None`,
/// makes the new row the root of its own group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArticle {
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
    pub tickers: BTreeSet<String>,
    pub dedupe_group: Option<i64>,
}

impl NewArticle {
    pub(crate) fn into_article(self, id: i64) -> Article {
        Article {
            id,
            title: self.title,
            canonical_url: self.canonical_url,
            raw_url: self.raw_url,
            provider: self.provider,
            source: self.source,
            guid: self.guid,
            summary: self.summary,
            published_at: self.published_at,
            published_at_estimated: self.published_at_estimated,
            fetched_at: self.fetched_at,
            last_seen_at: self.fetched_at,
            tickers: self.tickers,
            dedupe_group: self.dedupe_group.unwrap_or(id),
            title_key: self.title_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    PartialFailure,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::PartialFailure => "partial_failure",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(RunStatus::Running),
            "success" => Some(RunStatus::Success),
            "partial_failure" => Some(RunStatus::PartialFailure),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Per-source outcome of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStats {
    pub fetched: u64,
    pub inserted: u64,
    pub duplicates: u64,
    #[serde(default)]
    pub parse_errors: u64,
    /// Stored items that did not map to any ticker.
    pub mapping_errors: u64,
    #[serde(default)]
    pub degraded_dates: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_error: Option<String>,
}

/// One polling cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub per_source_stats: BTreeMap<String, SourceStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestionRun {
    pub fn started(id: i64, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            started_at,
            finished_at: None,
            status: RunStatus::Running,
            per_source_stats: BTreeMap::new(),
            error: None,
        }
    }

    pub fn total_inserted(&self) -> u64 {
        self.per_source_stats.values().map(|s| s.inserted).sum()
    }

    pub fn total_duplicates(&self) -> u64 {
        self.per_source_stats.values().map(|s| s.duplicates).sum()
    }

    pub fn failed_sources(&self) -> usize {
        self.per_source_stats
            .values()
            .filter(|s| s.fetch_error.is_some())
            .count()
    }
}
