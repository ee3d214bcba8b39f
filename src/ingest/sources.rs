// src/ingest/sources.rs
//! Source registry: which feeds to poll. Loaded from TOML or JSON, falling
//! back to a built-in list of wire feeds.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::ENV_SOURCES_CONFIG_PATH;
use crate::ingest::types::{FeedFormat, SourceSpec};
use crate::universe::TickerUniverse;

const PRNEWSWIRE_FEEDS: &[(&str, &str)] = &[
    ("prnewswire-financial", "https://www.prnewswire.com/rss/financial-services-latest-news/financial-services-latest-news-list.rss"),
    ("prnewswire-mutual-funds", "https://www.prnewswire.com/rss/financial-services-latest-news/mutual-funds-list.rss"),
    ("prnewswire-dividends", "https://www.prnewswire.com/rss/financial-services-latest-news/dividends-list.rss"),
    ("prnewswire-conference-calls", "https://www.prnewswire.com/rss/financial-services-latest-news/conference-call-announcements-list.rss"),
    ("prnewswire-earnings", "https://www.prnewswire.com/rss/financial-services-latest-news/earnings-list.rss"),
    ("prnewswire-offerings", "https://www.prnewswire.com/rss/financial-services-latest-news/stock-offering-list.rss"),
];

const GLOBENEWSWIRE_FEEDS: &[(&str, &str)] = &[
    ("globenewswire-cef", "https://rss.globenewswire.com/en/RssFeed/industry/30204000-Closed%20End%20Investments/feedTitle/CEF%20Industry"),
    ("globenewswire-nyse", "https://rss.globenewswire.com/en/RssFeed/exchange/NYSE/feedTitle/NYSE%20News"),
    ("globenewswire-public", "https://rss.globenewswire.com/en/RssFeed/orgclass/1/feedTitle/Public%20Companies"),
];

pub const YAHOO_HEADLINE_TEMPLATE: &str =
    "https://feeds.finance.yahoo.com/rss/2.0/headline?s={symbols}&region=US&lang=en-US";

/// A feed parameterised by ticker symbols; expanded into chunks of the
/// active universe at the start of every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolFeedSpec {
    pub id: String,
    pub provider: String,
    /// Must contain `{symbols}`.
    pub url_template: String,
    #[serde(default)]
    pub format: FeedFormat,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRegistry {
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
    #[serde(default)]
    pub symbol_feeds: Vec<SymbolFeedSpec>,
}

impl SourceRegistry {
    pub fn builtin() -> Self {
        let feed = |provider: &str, (id, url): &(&str, &str)| SourceSpec {
            id: id.to_string(),
            provider: provider.to_string(),
            url: url.to_string(),
            format: FeedFormat::Rss,
            enabled: true,
            timeout_secs: None,
            context_symbols: Vec::new(),
        };
        let mut sources: Vec<SourceSpec> = PRNEWSWIRE_FEEDS
            .iter()
            .map(|f| feed("PR Newswire", f))
            .collect();
        sources.extend(GLOBENEWSWIRE_FEEDS.iter().map(|f| feed("GlobeNewswire", f)));

        Self {
            sources,
            symbol_feeds: vec![SymbolFeedSpec {
                id: "yahoo".into(),
                provider: "Yahoo Finance".into(),
                url_template: YAHOO_HEADLINE_TEMPLATE.into(),
                format: FeedFormat::Rss,
                chunk_size: None,
                enabled: true,
                timeout_secs: None,
            }],
        }
    }

    /// Resolve the concrete feeds for one run. Symbol feeds are split into
    /// chunks of the universe's active symbols (sorted, so ids are stable).
    pub fn expand(&self, universe: &TickerUniverse, default_chunk: usize) -> Vec<SourceSpec> {
        let mut out: Vec<SourceSpec> = self.sources.iter().filter(|s| s.enabled).cloned().collect();
        let symbols: Vec<String> = universe.active_symbols().into_iter().collect();
        for sf in self.symbol_feeds.iter().filter(|s| s.enabled) {
            let chunk = sf.chunk_size.unwrap_or(default_chunk).max(1);
            for (i, group) in symbols.chunks(chunk).enumerate() {
                let joined = group
                    .iter()
                    .map(|s| url::form_urlencoded::byte_serialize(s.as_bytes()).collect::<String>())
                    .collect::<Vec<_>>()
                    .join(",");
                out.push(SourceSpec {
                    id: format!("{}-{}", sf.id, i + 1),
                    provider: sf.provider.clone(),
                    url: sf.url_template.replace("{symbols}", &joined),
                    format: sf.format,
                    enabled: true,
                    timeout_secs: sf.timeout_secs,
                    context_symbols: group.to_vec(),
                });
            }
        }
        out
    }

    fn validate(self) -> Result<Self> {
        let mut ids = BTreeSet::new();
        for s in &self.sources {
            if s.id.trim().is_empty() || s.url.trim().is_empty() {
                return Err(anyhow!("source entries need a non-empty id and url"));
            }
            if !ids.insert(s.id.clone()) {
                return Err(anyhow!("duplicate source id: {}", s.id));
            }
        }
        for sf in &self.symbol_feeds {
            if !sf.url_template.contains("{symbols}") {
                return Err(anyhow!("symbol feed {} has no {{symbols}} placeholder", sf.id));
            }
            if !ids.insert(sf.id.clone()) {
                return Err(anyhow!("duplicate source id: {}", sf.id));
            }
        }
        Ok(self)
    }
}

/// Load a registry from an explicit path. Supports TOML or JSON formats.
pub fn load_registry_from(path: &Path) -> Result<SourceRegistry> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("reading source registry from {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    parse_registry(&content, ext.as_str())
        .with_context(|| format!("parsing source registry {}", path.display()))
}

/// Load the registry using an explicit path + fallbacks:
/// 1) `explicit` (from $SOURCES_CONFIG_PATH)
/// 2) config/sources.toml
/// 3) config/sources.json
/// 4) built-in registry
pub fn load_registry(explicit: Option<&Path>) -> Result<SourceRegistry> {
    if let Some(p) = explicit {
        if p.exists() {
            return load_registry_from(p);
        }
        return Err(anyhow!(
            "{ENV_SOURCES_CONFIG_PATH} points to non-existent path {}",
            p.display()
        ));
    }
    let toml_p = PathBuf::from("config/sources.toml");
    if toml_p.exists() {
        return load_registry_from(&toml_p);
    }
    let json_p = PathBuf::from("config/sources.json");
    if json_p.exists() {
        return load_registry_from(&json_p);
    }
    Ok(SourceRegistry::builtin())
}

fn parse_registry(s: &str, hint_ext: &str) -> Result<SourceRegistry> {
    let reg = match hint_ext {
        "toml" => toml::from_str::<SourceRegistry>(s)?,
        "json" => serde_json::from_str::<SourceRegistry>(s)?,
        _ => match toml::from_str::<SourceRegistry>(s) {
            Ok(r) => r,
            Err(_) => serde_json::from_str::<SourceRegistry>(s)
                .map_err(|_| anyhow!("unsupported source registry format"))?,
        },
    };
    reg.validate()
}
