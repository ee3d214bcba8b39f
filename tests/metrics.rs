// tests/metrics.rs
use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use cef_newswire::ingest::fetch::{StaticFetcher, StaticResponse};
use cef_newswire::ingest::scheduler::StopSignal;
use cef_newswire::ingest::sources::SourceRegistry;
use cef_newswire::ingest::types::{FeedFormat, SourceSpec};
use cef_newswire::ingest::{IngestPipeline, PipelineConfig};
use cef_newswire::metrics::Metrics;
use cef_newswire::store::memory::MemoryStore;
use cef_newswire::universe::{TickerUniverse, UniverseHandle};

// One recorder per process, so everything lives in a single test.
#[tokio::test]
async fn metrics_endpoint_exposes_ingestion_series() {
    let metrics = Metrics::install().expect("first install succeeds");
    assert!(Metrics::install().is_err(), "a second recorder is rejected");

    let registry = SourceRegistry {
        sources: vec![
            SourceSpec {
                id: "prn".into(),
                provider: "PR Newswire".into(),
                url: "https://prn.test/rss".into(),
                format: FeedFormat::Rss,
                enabled: true,
                timeout_secs: None,
                context_symbols: vec![],
            },
            SourceSpec {
                id: "down".into(),
                provider: "GlobeNewswire".into(),
                url: "https://down.test/rss".into(),
                format: FeedFormat::Rss,
                enabled: true,
                timeout_secs: None,
                context_symbols: vec![],
            },
        ],
        symbol_feeds: vec![],
    };
    let fetcher = StaticFetcher::new()
        .with("prn", StaticResponse::Body(include_str!("fixtures/prn_rss.xml").into()))
        .with("down", StaticResponse::Error("503".into()));
    let universe =
        UniverseHandle::new(TickerUniverse::from_csv_str(include_str!("fixtures/cef_tickers.csv")).unwrap());
    let pipeline = IngestPipeline::new(
        Arc::new(MemoryStore::new()),
        universe,
        registry,
        fetcher.into_shared(),
        PipelineConfig::default(),
    );
    let run = pipeline.tracker().begin().await.unwrap();
    pipeline.execute(run, &StopSignal::never()).await;

    let resp = metrics
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    // axum::body::to_bytes requires an explicit limit
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap(); // 1 MiB
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "ingest_runs_total",
        "ingest_entries_total",
        "ingest_inserted_total",
        "ingest_parse_errors_total",
        "ingest_source_errors_total",
        "ingest_fetch_ms",
        "ingest_last_run_ts",
    ] {
        assert!(text.contains(needle), "missing series {needle} in:\n{text}");
    }
}
