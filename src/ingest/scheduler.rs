// src/ingest/scheduler.rs
//! Recurring ingestion with a process-wide "one run at a time" guarantee.

use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::ingest::IngestPipeline;
use crate::model::IngestionRun;
use crate::store::StoreError;

/// Cooperative shutdown flag, checked by the pipeline at safe points.
#[derive(Debug, Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop has been requested.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // sender gone without stopping: never fires
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Holds the running flag; releasing happens on drop, so a failed or
/// panicking run cannot leave the flag set.
pub struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl RunGuard {
    fn try_acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Started { run_id: i64 },
    Skipped,
}

pub struct Scheduler {
    pipeline: Arc<IngestPipeline>,
    running: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<IngestPipeline>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            pipeline,
            running: Arc::new(AtomicBool::new(false)),
            stop_tx,
            task: Mutex::new(None),
        })
    }

    pub fn pipeline(&self) -> &Arc<IngestPipeline> {
        &self.pipeline
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stop_signal(&self) -> StopSignal {
        StopSignal {
            rx: self.stop_tx.subscribe(),
        }
    }

    fn record_skip(&self, trigger: &'static str) {
        counter!("ingest_skipped_total").increment(1);
        info!(target: "scheduler", trigger, "ingestion run already in progress; skipped");
    }

    /// Start the recurring task. The first run happens immediately; missed
    /// ticks are skipped rather than bursted. Calling twice is a no-op, and
    /// starting after [`Self::stop`] clears the stop request.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut slot = match self.task.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_some() {
            return;
        }
        self.stop_tx.send_replace(false);
        let this = Arc::clone(self);
        let mut stop = self.stop_signal();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(target: "scheduler", interval_secs = interval.as_secs(), "scheduler started");
            loop {
                tokio::select! {
                    _ = stop.stopped() => break,
                    _ = ticker.tick() => {
                        if this.run_exclusive().await.is_none() {
                            this.record_skip("timer");
                        }
                    }
                }
            }
            info!(target: "scheduler", "scheduler stopped");
        }));
    }

    /// Signal the recurring task and any in-flight run to stop, then wait for
    /// the task to exit. Manual runs stay stopped until the next `start`.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = match self.task.lock() {
            Ok(mut g) => g.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(h) = handle {
            if let Err(e) = h.await {
                warn!(target: "scheduler", error = %e, "scheduler task ended abnormally");
            }
        }
    }

    /// Request an immediate run. Returns `Skipped` at once if a run is in
    /// progress; otherwise records the run and executes it in the background.
    pub async fn trigger_once(&self) -> Result<TriggerOutcome, StoreError> {
        let Some(guard) = RunGuard::try_acquire(&self.running) else {
            self.record_skip("manual");
            return Ok(TriggerOutcome::Skipped);
        };
        let run = self.pipeline.tracker().begin().await?;
        let run_id = run.id;
        let pipeline = Arc::clone(&self.pipeline);
        let stop = self.stop_signal();
        tokio::spawn(async move {
            let _guard = guard;
            pipeline.execute(run, &stop).await;
        });
        Ok(TriggerOutcome::Started { run_id })
    }

    /// Run inline under the same guard; `None` when skipped.
    pub async fn run_exclusive(&self) -> Option<IngestionRun> {
        let _guard = RunGuard::try_acquire(&self.running)?;
        let run = match self.pipeline.tracker().begin().await {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "scheduler", error = %e, "could not record ingestion run");
                return None;
            }
        };
        let stop = self.stop_signal();
        Some(self.pipeline.execute(run, &stop).await)
    }
}
