// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod query;
pub mod store;
pub mod universe;

use std::sync::Arc;

use anyhow::{Context, Result};
use shuttle_axum::axum::Router;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::api::{cors_layer, create_router, AppState};
use crate::config::Settings;
use crate::ingest::fetch::{FeedFetcher, HttpFetcher};
use crate::ingest::scheduler::Scheduler;
use crate::ingest::sources::{load_registry, SourceRegistry};
use crate::ingest::{IngestPipeline, PipelineConfig};
use crate::query::QueryService;
use crate::store::DynStore;
use crate::universe::UniverseHandle;

/// Install the global subscriber. `RUST_LOG` overrides the default filter;
/// `LOG_FORMAT=json` switches to JSON lines. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("cef_newswire=info,warn"));
    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    let _ = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().compact()).try_init()
    };
}

/// Everything the binary needs: the HTTP router and the scheduler to start.
pub struct App {
    pub router: Router,
    pub scheduler: Arc<Scheduler>,
    pub settings: Settings,
}

/// Wire the production app from settings: open the store, load the ticker
/// universe and source registry, close runs a crashed process left open.
pub async fn build_app(settings: &Settings) -> Result<App> {
    let store = store::open(&settings.database_url)
        .await
        .with_context(|| format!("opening store {}", settings.database_url))?;
    let universe = UniverseHandle::from_path(&settings.tickers_csv_path)
        .with_context(|| format!("loading tickers from {}", settings.tickers_csv_path.display()))?;
    let registry = load_registry(settings.sources_config_path.as_deref())?;
    let fetcher: Arc<dyn FeedFetcher> = Arc::new(HttpFetcher::new()?);

    let app = build_app_with(store, universe, registry, fetcher, settings.clone());
    app.scheduler
        .pipeline()
        .tracker()
        .recover_stale()
        .await
        .context("closing stale ingestion runs")?;
    info!(
        target: "api",
        tickers = app.scheduler.pipeline().universe().snapshot().len(),
        "application wired"
    );
    Ok(app)
}

/// Wire an app from explicit parts (tests inject a memory store and a
/// static fetcher here).
pub fn build_app_with(
    store: DynStore,
    universe: UniverseHandle,
    registry: SourceRegistry,
    fetcher: Arc<dyn FeedFetcher>,
    settings: Settings,
) -> App {
    let pipeline = Arc::new(IngestPipeline::new(
        store.clone(),
        universe.clone(),
        registry,
        fetcher,
        PipelineConfig::from_settings(&settings),
    ));
    let scheduler = Scheduler::new(pipeline);
    let state = AppState {
        query: QueryService::new(store.clone(), settings.default_unmapped_provider.clone()),
        scheduler: scheduler.clone(),
        universe,
        store,
    };
    let router = create_router(state, cors_layer(&settings));
    App {
        router,
        scheduler,
        settings,
    }
}
