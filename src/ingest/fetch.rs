// src/ingest/fetch.rs
//! Per-source feed retrieval with bounded concurrency.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::ingest::providers::adapter_for;
use crate::ingest::scheduler::StopSignal;
use crate::ingest::types::{RawEntry, SourceSpec};

pub const USER_AGENT: &str = concat!("cef-newswire/", env!("CARGO_PKG_VERSION"));
const ACCEPT: &str = "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.1";

#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Return the raw feed body for `spec`.
    async fn fetch(&self, spec: &SourceSpec, timeout: Duration) -> Result<String>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("building http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, spec: &SourceSpec, timeout: Duration) -> Result<String> {
        let resp = self
            .client
            .get(&spec.url)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("GET {}", spec.url))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("GET {} returned {}", spec.url, status));
        }
        resp.text().await.context("reading feed body")
    }
}

/// Result of fetching and parsing one source.
#[derive(Debug, Clone)]
pub struct SourceFetch {
    pub spec: SourceSpec,
    pub fetched_at: DateTime<Utc>,
    pub outcome: Result<Vec<RawEntry>, String>,
}

/// Fetch every source, at most `concurrency` at a time. Each fetch is bounded
/// by its own timeout and by `deadline`; a source that fails, times out or
/// returns a malformed envelope only affects its own result. Results come back
/// in `specs` order.
pub async fn fetch_all(
    fetcher: &dyn FeedFetcher,
    specs: &[SourceSpec],
    default_timeout: Duration,
    concurrency: usize,
    deadline: Instant,
    stop: &StopSignal,
) -> Vec<SourceFetch> {
    let mut results: Vec<(usize, SourceFetch)> = stream::iter(specs.iter().cloned().enumerate())
        .map(|(i, spec)| async move {
            let outcome = fetch_one(fetcher, &spec, default_timeout, deadline, stop).await;
            (
                i,
                SourceFetch {
                    spec,
                    fetched_at: Utc::now(),
                    outcome,
                },
            )
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;
    results.sort_by_key(|(i, _)| *i);
    results.into_iter().map(|(_, r)| r).collect()
}

async fn fetch_one(
    fetcher: &dyn FeedFetcher,
    spec: &SourceSpec,
    default_timeout: Duration,
    deadline: Instant,
    stop: &StopSignal,
) -> Result<Vec<RawEntry>, String> {
    if stop.is_stopped() {
        return Err("skipped: shutdown requested".to_string());
    }
    let now = Instant::now();
    if now >= deadline {
        return Err("skipped: run deadline exceeded".to_string());
    }
    let per_source = spec
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(default_timeout);
    let until = deadline.min(now + per_source);

    let t0 = std::time::Instant::now();
    let fetched = tokio::time::timeout_at(until, fetcher.fetch(spec, per_source)).await;
    histogram!("ingest_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

    let body = match fetched {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => return Err(fail(spec, format!("{e:#}"))),
        Err(_) => return Err(fail(spec, format!("timed out after {} ms", t0.elapsed().as_millis()))),
    };
    let adapter = adapter_for(spec.format);
    let entries = adapter
        .parse(&body)
        .map_err(|e| fail(spec, format!("{e:#}")))?;
    tracing::debug!(
        target: "ingest",
        source = %spec.id,
        adapter = adapter.name(),
        entries = entries.len(),
        "feed parsed"
    );
    Ok(entries)
}

fn fail(spec: &SourceSpec, msg: String) -> String {
    tracing::warn!(target: "ingest", source = %spec.id, error = %msg, "source fetch failed");
    counter!("ingest_source_errors_total").increment(1);
    msg
}

/// Canned response for [`StaticFetcher`].
#[derive(Debug, Clone)]
pub enum StaticResponse {
    Body(String),
    Error(String),
    /// Wait, then answer with the body.
    Delayed(Duration, String),
}

/// In-process fetcher for tests and local demos: answers per source id,
/// and errors for ids it has no response for.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    responses: Mutex<HashMap<String, StaticResponse>>,
    calls: AtomicUsize,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, source_id: &str, response: StaticResponse) -> Self {
        self.set(source_id, response);
        self
    }

    pub fn set(&self, source_id: &str, response: StaticResponse) {
        let mut map = match self.responses.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.insert(source_id.to_string(), response);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn into_shared(self) -> Arc<dyn FeedFetcher> {
        Arc::new(self)
    }
}

#[async_trait]
impl FeedFetcher for StaticFetcher {
    async fn fetch(&self, spec: &SourceSpec, _timeout: Duration) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = {
            let map = match self.responses.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            map.get(&spec.id).cloned()
        };
        match response {
            Some(StaticResponse::Body(b)) => Ok(b),
            Some(StaticResponse::Error(e)) => Err(anyhow!(e)),
            Some(StaticResponse::Delayed(d, b)) => {
                tokio::time::sleep(d).await;
                Ok(b)
            }
            None => Err(anyhow!("no canned response for {}", spec.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::FeedFormat;

    fn spec(id: &str, timeout_secs: Option<u64>) -> SourceSpec {
        SourceSpec {
            id: id.into(),
            provider: "Test".into(),
            url: format!("https://{id}.test/rss"),
            format: FeedFormat::Rss,
            enabled: true,
            timeout_secs,
            context_symbols: vec![],
        }
    }

    const FEED: &str = r#"<rss><channel><item><title>Hello</title><link>https://x.test/1</link></item></channel></rss>"#;

    #[tokio::test]
    async fn failures_are_isolated_and_order_is_kept() {
        let fetcher = StaticFetcher::new()
            .with("slow", StaticResponse::Delayed(Duration::from_secs(5), FEED.into()))
            .with("ok", StaticResponse::Body(FEED.into()))
            .with("down", StaticResponse::Error("connection refused".into()))
            .with("garbage", StaticResponse::Body("<html>nope".into()));
        let specs = vec![
            spec("slow", Some(1)),
            spec("ok", None),
            spec("down", None),
            spec("garbage", None),
        ];
        let deadline = Instant::now() + Duration::from_secs(30);
        let out = fetch_all(
            &fetcher,
            &specs,
            Duration::from_secs(10),
            2,
            deadline,
            &StopSignal::never(),
        )
        .await;

        let ids: Vec<&str> = out.iter().map(|r| r.spec.id.as_str()).collect();
        assert_eq!(ids, vec!["slow", "ok", "down", "garbage"]);
        assert!(out[0].outcome.as_ref().unwrap_err().contains("timed out"));
        assert_eq!(out[1].outcome.as_ref().unwrap().len(), 1);
        assert!(out[2].outcome.as_ref().unwrap_err().contains("connection refused"));
        assert!(out[3].outcome.is_err());
    }

    #[tokio::test]
    async fn run_deadline_bounds_stragglers() {
        let fetcher = StaticFetcher::new()
            .with("slow", StaticResponse::Delayed(Duration::from_secs(30), FEED.into()));
        let started = Instant::now();
        let out = fetch_all(
            &fetcher,
            &[spec("slow", None)],
            Duration::from_secs(60),
            1,
            started + Duration::from_millis(200),
            &StopSignal::never(),
        )
        .await;
        assert!(out[0].outcome.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
