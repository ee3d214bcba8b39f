// src/ingest/tickers.rs
//! Map article text onto universe symbols.
//!
//! Rules are unioned, never first-match:
//! - exchange context `(NYSE: GOF)`, `NYSE American: FOF, GOF` and bare `(GOF)`
//! - case-sensitive tokens equal to an active symbol, minus common words
//! - fund names and sponsor names
//! - the symbol a per-symbol feed is scoped to
//!
//! Only active symbols are ever returned, and results live in ordered maps so
//! the output is a pure function of text and universe.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};

use crate::universe::TickerUniverse;

/// Upper-case words that collide with real symbols in ordinary prose.
const COMMON_WORDS: &[&str] = &[
    "A", "AI", "ALL", "AN", "AND", "ARE", "AS", "AT", "BE", "BIG", "BY", "CAN", "CEO", "CFO",
    "DAY", "ETF", "EPS", "FOR", "FROM", "FUND", "GDP", "HAS", "IN", "INC", "IPO", "IS", "IT",
    "LLC", "LP", "NAV", "NEW", "NOT", "NOW", "NYSE", "OF", "ON", "ONE", "OR", "OUT", "PR",
    "Q", "SEC", "THE", "TO", "TOP", "TSX", "US", "USA", "USD", "WITH",
];

static RE_EXCHANGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"\b(?i:nyse\s+american|nyse\s+arca|nyse\s+mkt|nyse|nasdaq(?:gs|gm|cm)?|amex|cboe|otcqb|otcqx|otc|tsx)\s*[:\-]\s*([A-Z][A-Z0-9.]{0,5}(?:\s*(?:,|&|and)\s*[A-Z][A-Z0-9.]{0,5})*)",
    )
    .expect("exchange regex")
});
static RE_PAREN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(([A-Z][A-Z0-9.]{0,5})\)").expect("paren regex"));
static RE_SYMBOL_LIST_SPLIT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\s*(?:,|&|\band\b)\s*").expect("split regex"));
static RE_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z0-9][A-Za-z0-9.]*").expect("token regex"));

/// How a symbol was matched; later variants are stronger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Sponsor,
    Name,
    Token,
    Paren,
    Exchange,
    FeedContext,
}

#[derive(Debug, Clone)]
struct NamePattern {
    needle: String,
    symbols: Vec<String>,
    kind: MatchKind,
}

/// Compiled view of one universe snapshot.
#[derive(Debug, Clone)]
pub struct TickerMapper {
    active: BTreeSet<String>,
    names: Vec<NamePattern>,
}

impl TickerMapper {
    pub fn new(universe: &TickerUniverse) -> Self {
        let active = universe.active_symbols();
        let mut names = Vec::new();

        let mut by_sponsor: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for e in universe.active() {
            let fund = fold(&e.fund_name);
            if fund.chars().count() >= 6 {
                names.push(NamePattern {
                    needle: fund,
                    symbols: vec![e.symbol.clone()],
                    kind: MatchKind::Name,
                });
            }
            let sponsor = fold(&e.sponsor);
            if sponsor.chars().count() >= 4 {
                by_sponsor.entry(sponsor).or_default().push(e.symbol.clone());
            }
        }
        for (needle, symbols) in by_sponsor {
            names.push(NamePattern {
                needle,
                symbols,
                kind: MatchKind::Sponsor,
            });
        }
        Self { active, names }
    }

    /// Symbol → strongest rule that produced it.
    pub fn map(
        &self,
        title: &str,
        summary: Option<&str>,
        context_symbols: &[String],
    ) -> BTreeMap<String, MatchKind> {
        let mut hits: BTreeMap<String, MatchKind> = BTreeMap::new();
        let mut add = |symbol: &str, kind: MatchKind| {
            let symbol = symbol.trim_end_matches('.');
            if !self.active.contains(symbol) {
                return;
            }
            hits.entry(symbol.to_string())
                .and_modify(|k| *k = (*k).max(kind))
                .or_insert(kind);
        };

        if let [only] = context_symbols {
            add(&only.to_ascii_uppercase(), MatchKind::FeedContext);
        }

        for field in std::iter::once(title).chain(summary) {
            for cap in RE_EXCHANGE.captures_iter(field) {
                if let Some(list) = cap.get(1) {
                    for sym in RE_SYMBOL_LIST_SPLIT.split(list.as_str()) {
                        add(sym.trim(), MatchKind::Exchange);
                    }
                }
            }
            for cap in RE_PAREN.captures_iter(field) {
                if let Some(sym) = cap.get(1) {
                    add(sym.as_str(), MatchKind::Paren);
                }
            }
            for tok in RE_TOKEN.find_iter(field) {
                let tok = tok.as_str().trim_end_matches('.');
                if !COMMON_WORDS.contains(&tok) {
                    add(tok, MatchKind::Token);
                }
            }
            let folded = fold(field);
            for p in &self.names {
                if contains_word(&folded, &p.needle) {
                    for s in &p.symbols {
                        add(s, p.kind);
                    }
                }
            }
        }
        hits
    }

    pub fn symbols(&self, title: &str, summary: Option<&str>, context_symbols: &[String]) -> BTreeSet<String> {
        self.map(title, summary, context_symbols).into_keys().collect()
    }
}

/// Lower-case and collapse punctuation runs to single spaces, so names match
/// regardless of commas, dashes or doubled whitespace.
fn fold(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    for c in s.chars() {
        if c.is_alphanumeric() || c == '&' {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(c.to_lowercase());
        } else {
            pending_space = true;
        }
    }
    out
}

/// Word-bounded substring search over folded text.
fn contains_word(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return false;
    }
    haystack.match_indices(needle).any(|(i, _)| {
        let before_ok = haystack[..i].chars().next_back().map_or(true, |c| c == ' ');
        let after_ok = haystack[i + needle.len()..]
            .chars()
            .next()
            .map_or(true, |c| c == ' ');
        before_ok && after_ok
    })
}
