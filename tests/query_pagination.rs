// tests/query_pagination.rs
//
// Read-path properties, checked against both store backends.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use cef_newswire::model::NewArticle;
use cef_newswire::query::{NewsParams, QueryService};
use cef_newswire::store::memory::MemoryStore;
use cef_newswire::store::sqlite::SqliteStore;
use cef_newswire::store::DynStore;

fn t(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap() + Duration::minutes(minute)
}

fn article(slug: &str, minute: i64, provider: &str, tickers: &[&str], group: Option<i64>) -> NewArticle {
    let title = format!("Story {slug}");
    NewArticle {
        title_key: title.to_lowercase(),
        title,
        canonical_url: format!("https://news.example.com/{slug}"),
        raw_url: format!("https://news.example.com/{slug}?utm_source=rss"),
        provider: provider.to_string(),
        source: provider.to_lowercase().replace(' ', "-"),
        guid: None,
        summary: Some(format!("Summary for {slug}")),
        published_at: t(minute),
        published_at_estimated: false,
        fetched_at: t(minute) + Duration::seconds(30),
        tickers: tickers.iter().map(|s| s.to_string()).collect(),
        dedupe_group: group,
    }
}

async fn stores() -> Vec<(&'static str, DynStore)> {
    let sqlite = SqliteStore::connect("sqlite::memory:").await.expect("sqlite in memory");
    vec![
        ("memory", Arc::new(MemoryStore::new()) as DynStore),
        ("sqlite", Arc::new(sqlite) as DynStore),
    ]
}

fn params(pairs: &[(&str, &str)]) -> NewsParams {
    let mut p = NewsParams::default();
    for (k, v) in pairs {
        let v = Some(v.to_string());
        match *k {
            "ticker" => p.ticker = v,
            "provider" => p.provider = v,
            "source" => p.source = v,
            "q" => p.q = v,
            "from" => p.from = v,
            "to" => p.to = v,
            "include_unmapped" => p.include_unmapped = v,
            "include_unmapped_from_provider" => p.include_unmapped_from_provider = v,
            "include_duplicates" => p.include_duplicates = v,
            "cursor" => p.cursor = v,
            "limit" => p.limit = v,
            other => panic!("unknown param {other}"),
        }
    }
    p
}

async fn walk(svc: &QueryService, base: &[(&str, &str)], mut between: impl FnMut(usize) -> Option<NewArticle>, store: &DynStore) -> Vec<i64> {
    let mut seen = Vec::new();
    let mut cursor: Option<String> = None;
    for page_no in 0..50 {
        let mut pairs = base.to_vec();
        if let Some(c) = cursor.as_deref() {
            pairs.push(("cursor", c));
        }
        let q = svc.parse(params(&pairs)).expect("valid query");
        let page = svc.list(&q).await.expect("list");
        seen.extend(page.items.iter().map(|a| a.id));
        if let Some(extra) = between(page_no) {
            store.insert_article(extra).await.expect("insert between pages");
        }
        match page.next_cursor {
            Some(c) => cursor = Some(c),
            None => return seen,
        }
    }
    panic!("pagination did not terminate");
}

#[tokio::test]
async fn cursor_walk_is_exact_under_concurrent_inserts() {
    for (name, store) in stores().await {
        let mut original = BTreeSet::new();
        // minutes 10 and 20 appear twice to exercise the id tie-break
        for (i, minute) in [10, 20, 20, 30, 40, 10, 50].iter().enumerate() {
            let a = store
                .insert_article(article(&format!("s{i}"), *minute, "PR Newswire", &["GOF"], None))
                .await
                .unwrap();
            original.insert(a.id);
        }
        let svc = QueryService::new(store.clone(), None);

        // after each page, publish a story newer than everything already seen
        let mut n = 0;
        let seen = walk(
            &svc,
            &[("ticker", "gof"), ("limit", "2")],
            |_| {
                n += 1;
                Some(article(&format!("late{n}"), 1_000 + n, "PR Newswire", &["GOF"], None))
            },
            &store,
        )
        .await;

        let unique: HashSet<i64> = seen.iter().copied().collect();
        assert_eq!(unique.len(), seen.len(), "{name}: no row may repeat");
        assert_eq!(
            seen.iter().copied().collect::<BTreeSet<_>>(),
            original,
            "{name}: every pre-existing row exactly once, late rows never"
        );

        // newest first, ties by id descending
        let q = svc.parse(params(&[("ticker", "GOF"), ("limit", "100")])).unwrap();
        let items = svc.list(&q).await.unwrap().items;
        for w in items.windows(2) {
            assert!(
                (w[0].published_at, w[0].id) > (w[1].published_at, w[1].id),
                "{name}: order"
            );
        }
    }
}

#[tokio::test]
async fn visibility_composes_mapped_and_unmapped_rows() {
    for (name, store) in stores().await {
        store
            .insert_article(article("mapped", 1, "PR Newswire", &["PDI"], None))
            .await
            .unwrap();
        store
            .insert_article(article("bw-unmapped", 2, "Business Wire", &[], None))
            .await
            .unwrap();
        store
            .insert_article(article("prn-unmapped", 3, "PR Newswire", &[], None))
            .await
            .unwrap();

        let svc = QueryService::new(store.clone(), None);
        let slugs = |items: Vec<cef_newswire::model::Article>| -> Vec<String> {
            items
                .into_iter()
                .map(|a| a.canonical_url.rsplit('/').next().unwrap_or_default().to_string())
                .collect()
        };
        let list = |pairs: Vec<(&'static str, &'static str)>| {
            let svc = svc.clone();
            async move {
                let q = svc.parse(params(&pairs)).unwrap();
                let total = svc.count(&q.filter).await.unwrap();
                let items = svc.list(&q).await.unwrap().items;
                assert_eq!(total as usize, items.len(), "count agrees with list");
                items
            }
        };

        assert_eq!(slugs(list(vec![]).await), vec!["mapped"], "{name}");
        assert_eq!(
            slugs(list(vec![("include_unmapped_from_provider", "Business Wire")]).await),
            vec!["bw-unmapped", "mapped"],
            "{name}"
        );
        assert_eq!(
            slugs(list(vec![("include_unmapped_from_provider", "business wire")]).await),
            vec!["mapped"],
            "{name}: provider names match exactly"
        );
        assert_eq!(
            slugs(list(vec![("include_unmapped", "true")]).await),
            vec!["prn-unmapped", "bw-unmapped", "mapped"],
            "{name}"
        );
        // a ticker filter never matches unmapped rows, whatever the flags
        assert_eq!(
            slugs(list(vec![("ticker", "PDI"), ("include_unmapped", "true")]).await),
            vec!["mapped"],
            "{name}"
        );

        // the configured default applies when the request names no provider
        let svc = QueryService::new(store.clone(), Some("Business Wire".into()));
        let q = svc.parse(params(&[])).unwrap();
        assert_eq!(svc.count(&q.filter).await.unwrap(), 2, "{name}");
    }
}

#[tokio::test]
async fn groups_collapse_to_the_earliest_matching_copy() {
    for (name, store) in stores().await {
        let root = store
            .insert_article(article("root", 10, "PR Newswire", &[], None))
            .await
            .unwrap();
        let copy = store
            .insert_article(article("copy", 15, "Yahoo Finance", &["GOF"], Some(root.id)))
            .await
            .unwrap();
        let late = store
            .insert_article(article("late", 20, "GlobeNewswire", &["GOF"], Some(root.id)))
            .await
            .unwrap();
        assert_eq!(root.dedupe_group, root.id);

        let svc = QueryService::new(store.clone(), None);
        let run = |pairs: Vec<(&'static str, &'static str)>| {
            let svc = svc.clone();
            async move {
                let q = svc.parse(params(&pairs)).unwrap();
                let ids: Vec<i64> = svc.list(&q).await.unwrap().items.iter().map(|a| a.id).collect();
                let total = svc.count(&q.filter).await.unwrap();
                (ids, total)
            }
        };

        // the unmapped root is filtered out first, so the earliest mapped copy represents
        assert_eq!(run(vec![]).await, (vec![copy.id], 1), "{name}");
        assert_eq!(run(vec![("include_unmapped", "1")]).await, (vec![root.id], 1), "{name}");
        assert_eq!(
            run(vec![("include_duplicates", "true"), ("include_unmapped", "true")]).await,
            (vec![late.id, copy.id, root.id], 3),
            "{name}"
        );
        assert_eq!(
            run(vec![("provider", "GlobeNewswire")]).await,
            (vec![late.id], 1),
            "{name}"
        );
        assert_eq!(run(vec![("provider", "globenewswire")]).await, (vec![], 0), "{name}");
    }
}

#[tokio::test]
async fn text_and_date_filters() {
    for (name, store) in stores().await {
        store
            .insert_article(article("alpha", 0, "PR Newswire", &["GOF"], None))
            .await
            .unwrap();
        store
            .insert_article(article("beta", 24 * 60, "PR Newswire", &["GOF"], None))
            .await
            .unwrap();
        let svc = QueryService::new(store.clone(), None);

        let count = |pairs: Vec<(&'static str, &'static str)>| {
            let svc = svc.clone();
            async move {
                let q = svc.parse(params(&pairs)).unwrap();
                svc.count(&q.filter).await.unwrap()
            }
        };
        assert_eq!(count(vec![("q", "ALPHA")]).await, 1, "{name}: q is case-insensitive");
        assert_eq!(count(vec![("q", "summary for")]).await, 2, "{name}: q searches summaries");
        assert_eq!(count(vec![("from", "2026-03-03")]).await, 1, "{name}");
        assert_eq!(count(vec![("to", "2026-03-02")]).await, 1, "{name}: date-only `to` covers the day");
        assert_eq!(
            count(vec![("from", "2026-03-02T12:00:00Z"), ("to", "2026-03-03T12:00:00Z")]).await,
            2,
            "{name}: bounds are inclusive"
        );
        assert_eq!(count(vec![("source", "pr-newswire")]).await, 2, "{name}");
        assert_eq!(count(vec![("source", "PR-NEWSWIRE")]).await, 0, "{name}: source is exact");
    }
}

#[tokio::test]
async fn feed_entry_ids_are_kept_with_the_row() {
    for (name, store) in stores().await {
        let stored = store
            .insert_article(NewArticle {
                guid: Some("302000001".into()),
                ..article("with-guid", 1, "PR Newswire", &["GOF"], None)
            })
            .await
            .unwrap();
        let back = store.get_article(stored.id).await.unwrap().expect("stored");
        assert_eq!(back.guid.as_deref(), Some("302000001"), "{name}");
    }
}

#[tokio::test]
async fn text_search_folds_ascii_case_the_same_on_every_backend() {
    for (name, store) in stores().await {
        store
            .insert_article(article("élan-fund", 0, "PR Newswire", &["GOF"], None))
            .await
            .unwrap();
        let svc = QueryService::new(store.clone(), None);
        let count = |q: &'static str| {
            let svc = svc.clone();
            async move {
                let q = svc.parse(params(&[("q", q)])).unwrap();
                svc.count(&q.filter).await.unwrap()
            }
        };
        assert_eq!(count("STORY ÉLAN").await, 0, "{name}");
        assert_eq!(count("STORY élan").await, 1, "{name}");
    }
}
