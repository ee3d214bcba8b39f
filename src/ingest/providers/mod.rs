// src/ingest/providers/mod.rs
//! Feed adapters: one per wire format, all producing [`RawEntry`] values.

pub mod atom;
pub mod rss;

use anyhow::Result;

use crate::ingest::types::{FeedFormat, RawEntry};

pub trait FeedAdapter: Send + Sync {
    /// Parse a whole feed document. A malformed envelope is an error for the
    /// source; individual entries are never rejected here.
    fn parse(&self, body: &str) -> Result<Vec<RawEntry>>;
    fn name(&self) -> &'static str;
}

static RSS: rss::RssAdapter = rss::RssAdapter;
static ATOM: atom::AtomAdapter = atom::AtomAdapter;

pub fn adapter_for(format: FeedFormat) -> &'static dyn FeedAdapter {
    match format {
        FeedFormat::Rss => &RSS,
        FeedFormat::Atom => &ATOM,
    }
}

/// Replace HTML entities that are common in feeds but undefined in XML.
pub(crate) fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
        .replace("&hellip;", "...")
        .replace("&reg;", "\u{00AE}")
        .replace("&trade;", "\u{2122}")
        .replace("&copy;", "\u{00A9}")
}

/// Trimmed, non-empty text or `None`.
pub(crate) fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}
