// src/ingest/providers/atom.rs
use anyhow::{Context, Result};
use quick_xml::de::from_str;
use serde::Deserialize;

use super::{non_empty, scrub_html_entities_for_xml, FeedAdapter};
use crate::ingest::types::RawEntry;

#[derive(Debug, Deserialize)]
struct Feed {
    #[serde(default, rename = "entry")]
    entries: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    title: Option<Text>,
    #[serde(default, rename = "link")]
    links: Vec<Link>,
    id: Option<String>,
    published: Option<String>,
    updated: Option<String>,
    summary: Option<Text>,
    content: Option<Text>,
}

#[derive(Debug, Deserialize)]
struct Link {
    #[serde(rename = "@href", default)]
    href: String,
    #[serde(rename = "@rel")]
    rel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

impl Entry {
    /// `rel="alternate"` (or no rel) wins over other link relations.
    fn best_link(&self) -> Option<String> {
        let alternate = self
            .links
            .iter()
            .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")) && !l.href.trim().is_empty());
        alternate
            .or_else(|| self.links.iter().find(|l| !l.href.trim().is_empty()))
            .map(|l| l.href.clone())
    }
}

/// Atom 1.0 `<feed><entry>` feeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct AtomAdapter;

impl FeedAdapter for AtomAdapter {
    fn parse(&self, body: &str) -> Result<Vec<RawEntry>> {
        let xml_clean = scrub_html_entities_for_xml(body);
        let feed: Feed = from_str(&xml_clean).context("parsing atom xml")?;
        Ok(feed
            .entries
            .into_iter()
            .map(|e| {
                let link = non_empty(e.best_link());
                RawEntry {
                    title: non_empty(e.title.map(|t| t.value)),
                    link,
                    guid: non_empty(e.id),
                    published: non_empty(e.published).or_else(|| non_empty(e.updated)),
                    summary: non_empty(e.summary.map(|t| t.value))
                        .or_else(|| non_empty(e.content.map(|t| t.value))),
                    origin: None,
                }
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "atom"
    }
}
