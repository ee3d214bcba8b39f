// src/ingest/providers/rss.rs
use anyhow::{Context, Result};
use quick_xml::de::from_str;
use serde::Deserialize;

use super::{non_empty, scrub_html_entities_for_xml, FeedAdapter};
use crate::ingest::types::RawEntry;

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(default, rename = "item")]
    items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    guid: Option<Text>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    source: Option<Text>,
}

/// Element whose attributes we ignore (`<guid isPermaLink="false">`, `<source url="...">`).
#[derive(Debug, Deserialize)]
struct Text {
    #[serde(rename = "$text", default)]
    value: String,
}

/// RSS 2.0 `<channel><item>` feeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct RssAdapter;

impl FeedAdapter for RssAdapter {
    fn parse(&self, body: &str) -> Result<Vec<RawEntry>> {
        let xml_clean = scrub_html_entities_for_xml(body);
        let rss: Rss = from_str(&xml_clean).context("parsing rss xml")?;
        Ok(rss
            .channel
            .items
            .into_iter()
            .map(|it| RawEntry {
                title: non_empty(it.title),
                link: non_empty(it.link),
                guid: non_empty(it.guid.map(|g| g.value)),
                published: non_empty(it.pub_date),
                summary: non_empty(it.description),
                origin: non_empty(it.source.map(|s| s.value)),
            })
            .collect())
    }

    fn name(&self) -> &'static str {
        "rss"
    }
}
