//! CEF newswire service: binary entrypoint.
//! Loads settings, wires the store/ingestion/API and starts the scheduler.

use anyhow::Context;
use shuttle_axum::ShuttleAxum;
use tracing::info;

use cef_newswire::config::Settings;
use cef_newswire::metrics::Metrics;
use cef_newswire::{build_app, init_tracing};

#[shuttle_runtime::main]
async fn axum() -> ShuttleAxum {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::from_env().context("reading settings")?;
    let metrics = Metrics::install()?;
    let app = build_app(&settings).await?;

    if settings.scheduler_enabled {
        app.scheduler.start(settings.ingest_interval);
    } else {
        info!(target: "scheduler", "scheduler disabled; use POST /admin/ingest/run-once");
    }

    let router = app.router.merge(metrics.router());
    Ok(router.into())
}
