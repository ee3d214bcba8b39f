// src/ingest/dedup.rs
//! Two-phase identity resolution: exact canonical URL, then a fuzzy title key
//! within a time window, across providers.

use chrono::Duration;

use crate::ingest::types::ArticleDraft;
use crate::store::{Store, StoreError};

/// Tokens kept in a title key.
pub const TITLE_KEY_TOKENS: usize = 8;
/// Keys shorter than this never fuzzy-match.
pub const MIN_KEY_TOKENS: usize = 3;

const LEADING_STOPWORDS: &[&str] = &["the", "a", "an"];

/// Lower-case, drop punctuation, strip leading stopwords, keep the first
/// [`TITLE_KEY_TOKENS`] tokens.
pub fn title_key(title: &str) -> String {
    let lowered: String = title
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    lowered
        .split_whitespace()
        .skip_while(|t| LEADING_STOPWORDS.contains(t))
        .take(TITLE_KEY_TOKENS)
        .collect::<Vec<_>>()
        .join(" ")
}

fn key_is_matchable(key: &str) -> bool {
    key.split(' ').filter(|t| !t.is_empty()).count() >= MIN_KEY_TOKENS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupDecision {
    /// Same canonical URL already stored; nothing is inserted.
    Exact { article_id: i64 },
    /// Same story under another URL; stored in the matched group.
    Fuzzy { group: i64, matched_id: i64 },
    New,
}

impl DedupDecision {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, DedupDecision::New)
    }

    pub fn group(&self) -> Option<i64> {
        match self {
            DedupDecision::Fuzzy { group, .. } => Some(*group),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Deduplicator {
    window: Duration,
}

impl Deduplicator {
    pub fn new(window_hours: i64) -> Self {
        Self {
            window: Duration::hours(window_hours.max(1)),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn classify(
        &self,
        store: &dyn Store,
        draft: &ArticleDraft,
    ) -> Result<DedupDecision, StoreError> {
        if let Some(hit) = store.find_by_canonical_url(&draft.canonical_url).await? {
            return Ok(DedupDecision::Exact { article_id: hit.id });
        }
        if !key_is_matchable(&draft.title_key) {
            return Ok(DedupDecision::New);
        }
        let candidates = store
            .find_title_candidates(
                &draft.title_key,
                draft.published_at - self.window,
                draft.published_at + self.window,
            )
            .await?;
        Ok(candidates
            .iter()
            .min_by_key(|a| a.precedence_key())
            .map(|a| DedupDecision::Fuzzy {
                group: a.dedupe_group,
                matched_id: a.id,
            })
            .unwrap_or(DedupDecision::New))
    }
}
