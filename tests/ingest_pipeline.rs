// tests/ingest_pipeline.rs
//
// End-to-end ingestion over canned feeds: normalize, dedup, map, store.

use std::sync::Arc;

use cef_newswire::ingest::fetch::{StaticFetcher, StaticResponse};
use cef_newswire::ingest::scheduler::StopSignal;
use cef_newswire::ingest::sources::SourceRegistry;
use cef_newswire::ingest::types::{FeedFormat, SourceSpec};
use cef_newswire::ingest::{IngestPipeline, PipelineConfig};
use cef_newswire::model::{IngestionRun, RunStatus};
use cef_newswire::store::memory::MemoryStore;
use cef_newswire::store::{ArticleFilter, DynStore, Store};
use cef_newswire::universe::{TickerUniverse, UniverseHandle};

const PRN_XML: &str = include_str!("fixtures/prn_rss.xml");
const YAHOO_XML: &str = include_str!("fixtures/yahoo_rss.xml");
const TICKERS_CSV: &str = include_str!("fixtures/cef_tickers.csv");

fn source(id: &str, provider: &str, context: &[&str]) -> SourceSpec {
    SourceSpec {
        id: id.to_string(),
        provider: provider.to_string(),
        url: format!("https://{id}.test/rss"),
        format: FeedFormat::Rss,
        enabled: true,
        timeout_secs: None,
        context_symbols: context.iter().map(|s| s.to_string()).collect(),
    }
}

fn registry(sources: Vec<SourceSpec>) -> SourceRegistry {
    SourceRegistry {
        sources,
        symbol_feeds: vec![],
    }
}

fn universe() -> UniverseHandle {
    UniverseHandle::new(TickerUniverse::from_csv_str(TICKERS_CSV).expect("fixture csv"))
}

fn pipeline(store: DynStore, reg: SourceRegistry, fetcher: StaticFetcher) -> IngestPipeline {
    IngestPipeline::new(
        store,
        universe(),
        reg,
        fetcher.into_shared(),
        PipelineConfig::default(),
    )
}

async fn run(p: &IngestPipeline) -> IngestionRun {
    let started = p.tracker().begin().await.expect("begin run");
    p.execute(started, &StopSignal::never()).await
}

fn everything() -> ArticleFilter {
    ArticleFilter {
        include_unmapped: true,
        include_duplicates: true,
        ..Default::default()
    }
}

fn wire_and_yahoo() -> (SourceRegistry, StaticFetcher) {
    let reg = registry(vec![
        source("prn", "PR Newswire", &[]),
        source("yahoo-gof", "Yahoo Finance", &["GOF"]),
    ]);
    let fetcher = StaticFetcher::new()
        .with("prn", StaticResponse::Body(PRN_XML.into()))
        .with("yahoo-gof", StaticResponse::Body(YAHOO_XML.into()));
    (reg, fetcher)
}

#[tokio::test]
async fn run_counts_inserts_duplicates_and_errors_per_source() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let (reg, fetcher) = wire_and_yahoo();
    let p = pipeline(store.clone(), reg, fetcher);

    let done = run(&p).await;
    assert_eq!(done.status, RunStatus::Success);
    assert!(done.finished_at.is_some());

    let prn = &done.per_source_stats["prn"];
    assert_eq!(prn.fetched, 4);
    assert_eq!(prn.inserted, 3);
    assert_eq!(prn.duplicates, 0);
    assert_eq!(prn.parse_errors, 1);
    assert_eq!(prn.mapping_errors, 1, "the Acme release maps to nothing");

    // one exact copy of the PRN link, one fuzzy copy under a Yahoo URL
    let yahoo = &done.per_source_stats["yahoo-gof"];
    assert_eq!(yahoo.fetched, 2);
    assert_eq!(yahoo.inserted, 1);
    assert_eq!(yahoo.duplicates, 2);

    assert_eq!(store.count_articles(&everything()).await.unwrap(), 4);
}

#[tokio::test]
async fn rerunning_the_same_feeds_is_idempotent() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let (reg, fetcher) = wire_and_yahoo();
    let p = pipeline(store.clone(), reg, fetcher);

    run(&p).await;
    let urls_before = store.canonical_urls().await.unwrap();

    let second = run(&p).await;
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.total_inserted(), 0);
    assert_eq!(store.canonical_urls().await.unwrap(), urls_before);
    assert_eq!(store.count_articles(&everything()).await.unwrap(), 4);
}

#[tokio::test]
async fn exact_duplicate_refreshes_last_seen_and_keeps_one_row() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let (reg, fetcher) = wire_and_yahoo();
    let p = pipeline(store.clone(), reg, fetcher);
    run(&p).await;

    let gof_url = "https://www.prnewswire.com/news-releases/gof-distribution-302000001.html";
    let first = store.find_by_canonical_url(gof_url).await.unwrap().expect("stored");
    assert!(first.last_seen_at >= first.fetched_at);

    run(&p).await;
    let again = store.find_by_canonical_url(gof_url).await.unwrap().expect("still stored");
    assert_eq!(again.id, first.id);
    assert!(again.last_seen_at > first.last_seen_at);
}

#[tokio::test]
async fn fuzzy_copy_joins_the_earliest_group_and_collapses_in_reads() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let (reg, fetcher) = wire_and_yahoo();
    let p = pipeline(store.clone(), reg, fetcher);
    run(&p).await;

    let root = store
        .find_by_canonical_url("https://www.prnewswire.com/news-releases/gof-distribution-302000001.html")
        .await
        .unwrap()
        .unwrap();
    let copy = store
        .find_by_canonical_url(
            "https://finance.yahoo.com/news/guggenheim-strategic-opportunities-fund-declares-130500123.html",
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(root.dedupe_group, root.id);
    assert_eq!(copy.dedupe_group, root.id);
    assert!(copy.tickers.contains("GOF"));
    // each row keeps the entry id its own feed assigned
    assert_eq!(root.guid.as_deref(), Some("302000001"));
    assert_eq!(copy.guid.as_deref(), Some("yahoo-bbb-222"));

    let gof = ArticleFilter {
        tickers: ["GOF".to_string()].into(),
        ..Default::default()
    };
    let visible = store.list_articles(&gof, None, 10).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, root.id);

    let all_copies = ArticleFilter {
        include_duplicates: true,
        ..gof
    };
    assert_eq!(store.count_articles(&all_copies).await.unwrap(), 2);
}

fn single_item(link: &str, title: &str, pub_date: &str) -> String {
    format!(
        r#"<rss version="2.0"><channel><item><title>{title}</title><link>{link}</link><pubDate>{pub_date}</pubDate></item></channel></rss>"#
    )
}

async fn two_copies(second_pub_date: &str) -> (i64, i64) {
    let store: DynStore = Arc::new(MemoryStore::new());
    let reg = registry(vec![
        source("wire-a", "PR Newswire", &[]),
        source("wire-b", "GlobeNewswire", &[]),
    ]);
    let title = "PIMCO Dynamic Income Fund Announces Special Distribution";
    let fetcher = StaticFetcher::new()
        .with(
            "wire-a",
            StaticResponse::Body(single_item(
                "https://a.example.com/pdi-special",
                title,
                "Mon, 02 Mar 2026 09:00:00 GMT",
            )),
        )
        .with(
            "wire-b",
            StaticResponse::Body(single_item(
                "https://b.example.com/news/pdi-special-distribution",
                title,
                second_pub_date,
            )),
        );
    let p = pipeline(store.clone(), reg, fetcher);
    let done = run(&p).await;
    assert_eq!(done.status, RunStatus::Success);

    let a = store
        .find_by_canonical_url("https://a.example.com/pdi-special")
        .await
        .unwrap()
        .unwrap();
    let b = store
        .find_by_canonical_url("https://b.example.com/news/pdi-special-distribution")
        .await
        .unwrap()
        .unwrap();
    (a.dedupe_group, b.dedupe_group)
}

#[tokio::test]
async fn same_title_minutes_apart_shares_a_group() {
    let (a, b) = two_copies("Mon, 02 Mar 2026 09:10:00 GMT").await;
    assert_eq!(a, b);
}

#[tokio::test]
async fn same_title_a_month_apart_stays_separate() {
    let (a, b) = two_copies("Wed, 01 Apr 2026 09:00:00 GMT").await;
    assert_ne!(a, b);
}

#[tokio::test]
async fn one_failing_source_yields_partial_failure() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let reg = registry(vec![
        source("prn", "PR Newswire", &[]),
        source("down", "GlobeNewswire", &[]),
    ]);
    let fetcher = StaticFetcher::new()
        .with("prn", StaticResponse::Body(PRN_XML.into()))
        .with("down", StaticResponse::Error("connection refused".into()));
    let p = pipeline(store.clone(), reg, fetcher);

    let done = run(&p).await;
    assert_eq!(done.status, RunStatus::PartialFailure);
    assert_eq!(done.per_source_stats["prn"].inserted, 3);
    let down = &done.per_source_stats["down"];
    assert!(down.fetch_error.as_deref().unwrap().contains("connection refused"));
    assert_eq!(down.fetched, 0);
}

#[tokio::test]
async fn every_source_failing_fails_the_run() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let reg = registry(vec![source("garbage", "PR Newswire", &[])]);
    let fetcher = StaticFetcher::new().with("garbage", StaticResponse::Body("<html>".into()));
    let p = pipeline(store.clone(), reg, fetcher);

    let done = run(&p).await;
    assert_eq!(done.status, RunStatus::Failed);
    assert_eq!(done.error.as_deref(), Some("all sources failed"));
}

#[tokio::test]
async fn storage_error_fails_the_run_and_is_persisted() {
    let mem = Arc::new(MemoryStore::new());
    mem.set_fail_writes(true);
    let store: DynStore = mem.clone();
    let (reg, fetcher) = wire_and_yahoo();
    let p = pipeline(store.clone(), reg, fetcher);

    let done = run(&p).await;
    assert_eq!(done.status, RunStatus::Failed);
    assert!(done.error.as_deref().unwrap().starts_with("storage error"));

    let stored = store.recent_runs(1).await.unwrap();
    assert_eq!(stored[0].id, done.id);
    assert_eq!(stored[0].status, RunStatus::Failed);
    assert!(p.tracker().current().is_none());

    // the process keeps going: the next run succeeds once writes recover
    mem.set_fail_writes(false);
    assert_eq!(run(&p).await.status, RunStatus::Success);
}

#[tokio::test]
async fn provider_comes_from_the_item_source_element() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let reg = registry(vec![source("yahoo-gof", "Yahoo Finance", &["GOF"])]);
    let fetcher = StaticFetcher::new().with("yahoo-gof", StaticResponse::Body(YAHOO_XML.into()));
    let p = pipeline(store.clone(), reg, fetcher);
    run(&p).await;

    let relayed = store
        .find_by_canonical_url("https://www.prnewswire.com/news-releases/gof-distribution-302000001.html")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(relayed.provider, "PR Newswire");
    assert_eq!(relayed.source, "yahoo-gof");

    let own = store
        .find_by_canonical_url(
            "https://finance.yahoo.com/news/guggenheim-strategic-opportunities-fund-declares-130500123.html",
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(own.provider, "Yahoo Finance");
}
