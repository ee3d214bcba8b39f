// src/ingest/mod.rs
pub mod dedup;
pub mod fetch;
pub mod normalize;
pub mod providers;
pub mod runs;
pub mod scheduler;
pub mod sources;
pub mod tickers;
pub mod types;

use chrono::Utc;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge};
use once_cell::sync::OnceCell;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::ingest::dedup::{DedupDecision, Deduplicator};
use crate::ingest::fetch::{fetch_all, FeedFetcher};
use crate::ingest::normalize::normalize_entry;
use crate::ingest::runs::{settle, RunTracker};
use crate::ingest::scheduler::StopSignal;
use crate::ingest::sources::SourceRegistry;
use crate::ingest::tickers::TickerMapper;
use crate::ingest::types::ArticleDraft;
use crate::model::{IngestionRun, SourceStats};
use crate::store::{DynStore, StoreError};
use crate::universe::UniverseHandle;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_runs_total", "Ingestion runs executed.");
        describe_counter!("ingest_entries_total", "Feed entries parsed from sources.");
        describe_counter!("ingest_inserted_total", "Articles written to the store.");
        describe_counter!(
            "ingest_duplicates_total",
            "Entries recognised as exact or fuzzy duplicates."
        );
        describe_counter!(
            "ingest_parse_errors_total",
            "Entries dropped for lacking both link and title."
        );
        describe_counter!("ingest_source_errors_total", "Source fetch/parse failures.");
        describe_counter!(
            "ingest_skipped_total",
            "Triggers skipped because a run was already in progress."
        );
        describe_histogram!("ingest_fetch_ms", "Per-source fetch time in milliseconds.");
        describe_gauge!("ingest_last_run_ts", "Unix ts when the last ingestion run finished.");
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineConfig {
    pub fetch_concurrency: usize,
    pub request_timeout: Duration,
    pub run_max_duration: Duration,
    pub dedup_window_hours: i64,
    pub symbol_chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl PipelineConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            fetch_concurrency: s.fetch_concurrency,
            request_timeout: s.request_timeout,
            run_max_duration: s.run_max_duration,
            dedup_window_hours: s.dedup_window_hours,
            symbol_chunk_size: s.yahoo_chunk_size,
        }
    }
}

/// fetch → normalize → dedup → map → store, for one run at a time.
pub struct IngestPipeline {
    store: DynStore,
    universe: UniverseHandle,
    registry: SourceRegistry,
    fetcher: Arc<dyn FeedFetcher>,
    tracker: RunTracker,
    dedup: Deduplicator,
    config: PipelineConfig,
}

impl IngestPipeline {
    pub fn new(
        store: DynStore,
        universe: UniverseHandle,
        registry: SourceRegistry,
        fetcher: Arc<dyn FeedFetcher>,
        config: PipelineConfig,
    ) -> Self {
        ensure_metrics_described();
        Self {
            tracker: RunTracker::new(store.clone()),
            dedup: Deduplicator::new(config.dedup_window_hours),
            store,
            universe,
            registry,
            fetcher,
            config,
        }
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    pub fn universe(&self) -> &UniverseHandle {
        &self.universe
    }

    /// Execute `run` (already recorded as running) to completion and persist
    /// its outcome. Never panics on source or storage failures; they end up
    /// in the returned run.
    pub async fn execute(&self, mut run: IngestionRun, stop: &StopSignal) -> IngestionRun {
        counter!("ingest_runs_total").increment(1);
        let run_error = self.ingest(&mut run, stop).await.err();
        settle(&mut run, run_error);
        gauge!("ingest_last_run_ts").set(Utc::now().timestamp() as f64);
        self.tracker.finish(run).await
    }

    async fn ingest(&self, run: &mut IngestionRun, stop: &StopSignal) -> Result<(), String> {
        // snapshot once: a reload mid-run does not affect this run
        let universe = self.universe.snapshot();
        let mapper = TickerMapper::new(&universe);
        let specs = self.registry.expand(&universe, self.config.symbol_chunk_size);
        let deadline = Instant::now() + self.config.run_max_duration;
        info!(target: "ingest", run_id = run.id, sources = specs.len(), "fetching sources");

        let fetched = fetch_all(
            self.fetcher.as_ref(),
            &specs,
            self.config.request_timeout,
            self.config.fetch_concurrency,
            deadline,
            stop,
        )
        .await;

        let mut stats: BTreeMap<String, SourceStats> = BTreeMap::new();
        let mut drafts: Vec<ArticleDraft> = Vec::new();
        for f in fetched {
            let s = stats.entry(f.spec.id.clone()).or_default();
            match f.outcome {
                Ok(entries) => {
                    s.fetched = entries.len() as u64;
                    counter!("ingest_entries_total").increment(s.fetched);
                    for entry in entries {
                        match normalize_entry(entry, &f.spec, f.fetched_at) {
                            Ok(d) => {
                                if d.published_at_estimated {
                                    s.degraded_dates += 1;
                                }
                                drafts.push(d);
                            }
                            Err(e) => {
                                debug!(target: "ingest", source = %f.spec.id, error = %e, "entry dropped");
                                s.parse_errors += 1;
                                counter!("ingest_parse_errors_total").increment(1);
                            }
                        }
                    }
                }
                Err(e) => s.fetch_error = Some(e),
            }
            self.tracker.record_source(&f.spec.id, s);
        }
        run.per_source_stats = stats;

        // oldest first, so the earliest copy of a story founds its group
        drafts.sort_by(|a, b| {
            (a.published_at, a.fetched_at).cmp(&(b.published_at, b.fetched_at))
        });

        for draft in drafts {
            if stop.is_stopped() {
                return Err("stopped before completion".to_string());
            }
            let source_id = draft.source.clone();
            let outcome = self.commit(draft, &mapper).await;
            let s = run.per_source_stats.entry(source_id.clone()).or_default();
            match outcome {
                Ok(Committed::Duplicate) => {
                    s.duplicates += 1;
                    counter!("ingest_duplicates_total").increment(1);
                }
                Ok(Committed::Inserted { fuzzy, mapped }) => {
                    s.inserted += 1;
                    counter!("ingest_inserted_total").increment(1);
                    if fuzzy {
                        s.duplicates += 1;
                        counter!("ingest_duplicates_total").increment(1);
                    }
                    if !mapped {
                        s.mapping_errors += 1;
                    }
                }
                Err(e) => {
                    warn!(target: "ingest", run_id = run.id, error = %e, "storage error; failing run");
                    return Err(format!("storage error: {e}"));
                }
            }
            self.tracker.record_source(&source_id, s);
        }
        Ok(())
    }

    /// Dedup, map and write one draft. The unique constraint on canonical URL
    /// backs up the exact check.
    async fn commit(&self, draft: ArticleDraft, mapper: &TickerMapper) -> Result<Committed, StoreError> {
        let decision = self.dedup.classify(self.store.as_ref(), &draft).await?;
        if let DedupDecision::Exact { article_id } = decision {
            self.store.touch_article(article_id, draft.fetched_at).await?;
            return Ok(Committed::Duplicate);
        }
        let tickers = mapper.symbols(&draft.title, draft.summary.as_deref(), &draft.context_symbols);
        let mapped = !tickers.is_empty();
        match self
            .store
            .insert_article(draft.into_new_article(tickers, decision.group()))
            .await
        {
            Ok(_) => Ok(Committed::Inserted {
                fuzzy: decision.is_duplicate(),
                mapped,
            }),
            Err(StoreError::Conflict(url)) => {
                debug!(target: "ingest", url = %url, "lost insert race; treating as duplicate");
                Ok(Committed::Duplicate)
            }
            Err(e) => Err(e),
        }
    }
}

enum Committed {
    Duplicate,
    Inserted { fuzzy: bool, mapped: bool },
}
