// src/universe.rs
//! Ticker universe: the tracked closed-end funds, loaded from a CSV snapshot
//! (`ticker,fund_name,sponsor,active`) and swappable at runtime.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

pub const DEFAULT_TICKERS_CSV_PATH: &str = "data/cef_tickers.csv";
pub const ENV_TICKERS_CSV_PATH: &str = "TICKERS_CSV_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TickerEntry {
    pub symbol: String,
    pub fund_name: String,
    pub sponsor: String,
    pub active: bool,
}

/// Immutable snapshot, keyed and iterated by symbol.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickerUniverse {
    entries: BTreeMap<String, TickerEntry>,
}

impl TickerUniverse {
    pub fn from_entries<I: IntoIterator<Item = TickerEntry>>(entries: I) -> Self {
        let mut map = BTreeMap::new();
        for mut e in entries {
            e.symbol = e.symbol.trim().to_ascii_uppercase();
            if e.symbol.is_empty() {
                continue;
            }
            map.insert(e.symbol.clone(), e);
        }
        Self { entries: map }
    }

    pub fn load_csv(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading ticker universe from {}", path.display()))?;
        Self::from_csv_str(&content)
            .with_context(|| format!("parsing ticker universe {}", path.display()))
    }

    /// Parse CSV text. Header names are matched case-insensitively, so column
    /// order is free; `fund_name`, `sponsor` and `active` are optional.
    pub fn from_csv_str(s: &str) -> Result<Self> {
        let s = s.strip_prefix('\u{feff}').unwrap_or(s);
        let mut lines = s.lines().filter(|l| !l.trim().is_empty());
        let header = lines.next().ok_or_else(|| anyhow!("ticker csv is empty"))?;
        let cols: Vec<String> = split_csv_line(header)
            .into_iter()
            .map(|c| c.trim().to_ascii_lowercase())
            .collect();
        let idx = |name: &str| cols.iter().position(|c| c == name);
        let i_ticker = idx("ticker")
            .or_else(|| idx("symbol"))
            .ok_or_else(|| anyhow!("ticker csv is missing a `ticker` column"))?;
        let (i_name, i_sponsor, i_active) = (idx("fund_name"), idx("sponsor"), idx("active"));

        let mut out = Vec::new();
        for line in lines {
            let fields = split_csv_line(line);
            let get = |i: Option<usize>| {
                i.and_then(|i| fields.get(i))
                    .map(|v| v.trim().to_string())
                    .unwrap_or_default()
            };
            let symbol = get(Some(i_ticker));
            if symbol.is_empty() {
                continue;
            }
            out.push(TickerEntry {
                symbol,
                fund_name: get(i_name),
                sponsor: get(i_sponsor),
                active: parse_active(&get(i_active)),
            });
        }
        Ok(Self::from_entries(out))
    }

    pub fn get(&self, symbol: &str) -> Option<&TickerEntry> {
        self.entries.get(symbol)
    }

    pub fn is_active(&self, symbol: &str) -> bool {
        self.entries.get(symbol).map(|e| e.active).unwrap_or(false)
    }

    pub fn entries(&self) -> impl Iterator<Item = &TickerEntry> {
        self.entries.values()
    }

    pub fn active(&self) -> impl Iterator<Item = &TickerEntry> {
        self.entries.values().filter(|e| e.active)
    }

    pub fn active_symbols(&self) -> BTreeSet<String> {
        self.active().map(|e| e.symbol.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_active(v: &str) -> bool {
    !matches!(
        v.to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "n"
    )
}

/// Split one CSV record; handles double-quoted fields and `""` escapes.
fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                cur.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut cur)),
            '\r' if !in_quotes => {}
            _ => cur.push(c),
        }
    }
    fields.push(cur);
    fields
}

/// Shared, reloadable view of the universe. Readers take a cheap `Arc`
/// snapshot so a reload never disturbs a run already in progress.
#[derive(Clone)]
pub struct UniverseHandle {
    inner: Arc<RwLock<Arc<TickerUniverse>>>,
    path: Option<PathBuf>,
}

impl UniverseHandle {
    pub fn new(universe: TickerUniverse) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(universe))),
            path: None,
        }
    }

    /// Load from `path` and remember it for later reloads.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let universe = TickerUniverse::load_csv(&path)?;
        info!(
            target: "universe",
            path = %path.display(),
            loaded = universe.len(),
            "ticker universe loaded"
        );
        Ok(Self {
            inner: Arc::new(RwLock::new(Arc::new(universe))),
            path: Some(path),
        })
    }

    pub fn snapshot(&self) -> Arc<TickerUniverse> {
        match self.inner.read() {
            Ok(g) => g.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, universe: TickerUniverse) {
        let fresh = Arc::new(universe);
        match self.inner.write() {
            Ok(mut g) => *g = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
    }

    /// Re-read the backing file. On failure the previous snapshot stays in place.
    pub fn reload(&self) -> Result<Arc<TickerUniverse>> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| anyhow!("ticker universe has no backing file"))?;
        match TickerUniverse::load_csv(path) {
            Ok(u) => {
                info!(target: "universe", loaded = u.len(), "ticker universe reloaded");
                self.replace(u);
                Ok(self.snapshot())
            }
            Err(e) => {
                warn!(target: "universe", error = ?e, "ticker universe reload failed");
                Err(e)
            }
        }
    }
}
