// src/ingest/runs.rs
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::model::{IngestionRun, RunStatus, SourceStats};
use crate::store::{DynStore, StoreError};

/// Snapshot served by the admin status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub running: bool,
    pub current: Option<IngestionRun>,
    pub last: Option<IngestionRun>,
    pub recent: Vec<IngestionRun>,
}

/// Records run lifecycles in the store and keeps the in-flight run's live
/// stats in memory so status reads never wait on the pipeline.
///
/// A finished run whose final write failed is held in memory and written
/// again before the next run starts; until then status reads serve the held
/// copy, so the store's stale `running` row is never shown as live.
pub struct RunTracker {
    store: DynStore,
    current: RwLock<Option<IngestionRun>>,
    unpersisted: Mutex<BTreeMap<i64, IngestionRun>>,
}

impl RunTracker {
    pub fn new(store: DynStore) -> Self {
        Self {
            store,
            current: RwLock::new(None),
            unpersisted: Mutex::new(BTreeMap::new()),
        }
    }

    fn unpersisted(&self) -> std::sync::MutexGuard<'_, BTreeMap<i64, IngestionRun>> {
        match self.unpersisted.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_current(&self, run: Option<IngestionRun>) {
        match self.current.write() {
            Ok(mut g) => *g = run,
            Err(poisoned) => *poisoned.into_inner() = run,
        }
    }

    pub fn current(&self) -> Option<IngestionRun> {
        match self.current.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Close runs a previous process left `running`.
    pub async fn recover_stale(&self) -> Result<u64, StoreError> {
        let closed = self.store.fail_stale_runs(Utc::now()).await?;
        if closed > 0 {
            warn!(target: "ingest", closed, "closed stale running runs from a previous process");
        }
        Ok(closed)
    }

    /// Persist a new `running` run. Callers must hold the scheduler's run guard.
    pub async fn begin(&self) -> Result<IngestionRun, StoreError> {
        self.flush_unpersisted().await;
        let run = self.store.create_run(Utc::now()).await?;
        info!(target: "ingest", run_id = run.id, "ingestion run started");
        self.set_current(Some(run.clone()));
        Ok(run)
    }

    pub fn record_source(&self, source_id: &str, stats: &SourceStats) {
        let mut guard = match self.current.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(run) = guard.as_mut() {
            run.per_source_stats.insert(source_id.to_string(), stats.clone());
        }
    }

    /// Persist the final state and clear the live run. The write is retried
    /// once; if both attempts fail the outcome is held for [`Self::begin`].
    pub async fn finish(&self, run: IngestionRun) -> IngestionRun {
        let mut written = self.store.finish_run(&run).await;
        if let Err(e) = &written {
            warn!(target: "ingest", run_id = run.id, error = %e, "failed to persist run outcome; retrying");
            written = self.store.finish_run(&run).await;
        }
        if let Err(e) = written {
            warn!(target: "ingest", run_id = run.id, error = %e, "run outcome kept in memory until the next run");
            self.unpersisted().insert(run.id, run.clone());
        }
        info!(
            target: "ingest",
            run_id = run.id,
            status = run.status.as_str(),
            inserted = run.total_inserted(),
            duplicates = run.total_duplicates(),
            failed_sources = run.failed_sources(),
            "ingestion run finished"
        );
        self.set_current(None);
        run
    }

    async fn flush_unpersisted(&self) {
        let pending: Vec<IngestionRun> = self.unpersisted().values().cloned().collect();
        for run in pending {
            match self.store.finish_run(&run).await {
                Ok(()) => {
                    self.unpersisted().remove(&run.id);
                    info!(target: "ingest", run_id = run.id, "held run outcome persisted");
                }
                Err(e) => {
                    warn!(target: "ingest", run_id = run.id, error = %e, "held run outcome still not persisted");
                }
            }
        }
    }

    pub async fn status(&self, limit: usize) -> Result<RunStatusView, StoreError> {
        let mut recent = self.store.recent_runs(limit.max(1)).await?;
        let current = self.current();
        let held = self.unpersisted().clone();
        // stored `running` rows are stale: show the live or held copy instead
        for r in recent.iter_mut() {
            if r.status != RunStatus::Running {
                continue;
            }
            if let Some(c) = current.as_ref().filter(|c| c.id == r.id) {
                *r = c.clone();
            } else if let Some(h) = held.get(&r.id) {
                *r = h.clone();
            } else if current.as_ref().is_some_and(|c| c.id > r.id) {
                // runs are serialized, so an older row cannot still be live
                r.status = RunStatus::Failed;
                r.error = Some("run outcome was not recorded".to_string());
            }
        }
        let last = recent
            .iter()
            .find(|r| r.status != RunStatus::Running)
            .cloned();
        Ok(RunStatusView {
            running: current.is_some(),
            current,
            last,
            recent,
        })
    }
}

/// Derive the final status from per-source outcomes and a run-level error.
pub fn settle(run: &mut IngestionRun, run_error: Option<String>) {
    run.finished_at = Some(Utc::now());
    let sources = run.per_source_stats.len();
    let failed = run.failed_sources();
    if let Some(e) = run_error {
        run.status = RunStatus::Failed;
        run.error = Some(e);
    } else if sources > 0 && failed == sources {
        run.status = RunStatus::Failed;
        run.error = Some("all sources failed".to_string());
    } else if failed > 0 {
        run.status = RunStatus::PartialFailure;
    } else {
        run.status = RunStatus::Success;
    }
}
