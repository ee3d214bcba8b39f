// src/config.rs
//! Runtime settings read from the environment (after `dotenvy` has loaded `.env`).
//! Malformed or out-of-range values are startup errors.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::universe::{DEFAULT_TICKERS_CSV_PATH, ENV_TICKERS_CSV_PATH};

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_SOURCES_CONFIG_PATH: &str = "SOURCES_CONFIG_PATH";
pub const ENV_SCHEDULER_ENABLED: &str = "SCHEDULER_ENABLED";
pub const ENV_INGEST_INTERVAL_SECONDS: &str = "INGEST_INTERVAL_SECONDS";
pub const ENV_REQUEST_TIMEOUT_SECONDS: &str = "REQUEST_TIMEOUT_SECONDS";
pub const ENV_FETCH_CONCURRENCY: &str = "FETCH_CONCURRENCY";
pub const ENV_RUN_MAX_DURATION_SECONDS: &str = "RUN_MAX_DURATION_SECONDS";
pub const ENV_DEDUP_WINDOW_HOURS: &str = "DEDUP_WINDOW_HOURS";
pub const ENV_YAHOO_CHUNK_SIZE: &str = "YAHOO_CHUNK_SIZE";
pub const ENV_CORS_ORIGINS: &str = "CORS_ORIGINS";
pub const ENV_DEFAULT_UNMAPPED_PROVIDER: &str = "DEFAULT_UNMAPPED_PROVIDER";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://data/cef_news.db";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub tickers_csv_path: PathBuf,
    /// Explicit registry file; `None` means "use fallbacks".
    pub sources_config_path: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub ingest_interval: Duration,
    pub request_timeout: Duration,
    pub fetch_concurrency: usize,
    pub run_max_duration: Duration,
    pub dedup_window_hours: i64,
    pub yahoo_chunk_size: usize,
    /// Empty or `["*"]` means permissive CORS.
    pub cors_origins: Vec<String>,
    pub default_unmapped_provider: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            tickers_csv_path: PathBuf::from(DEFAULT_TICKERS_CSV_PATH),
            sources_config_path: None,
            scheduler_enabled: true,
            ingest_interval: Duration::from_secs(60),
            request_timeout: Duration::from_secs(20),
            fetch_concurrency: 4,
            run_max_duration: Duration::from_secs(45),
            dedup_window_hours: 48,
            yahoo_chunk_size: 40,
            cors_origins: vec!["*".to_string()],
            default_unmapped_provider: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build settings from an arbitrary key lookup (env in production, maps in tests).
    pub fn from_lookup<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Settings::default();
        let var = |k: &str| get(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let interval = parse_or(&var, ENV_INGEST_INTERVAL_SECONDS, 60u64)?;
        if interval < 30 {
            return Err(anyhow!("{ENV_INGEST_INTERVAL_SECONDS} must be >= 30 (got {interval})"));
        }
        let timeout = parse_in_range(&var, ENV_REQUEST_TIMEOUT_SECONDS, 20u64, 5, 120)?;
        let concurrency = parse_in_range(&var, ENV_FETCH_CONCURRENCY, 4usize, 1, 32)?;
        let max_run = parse_or(&var, ENV_RUN_MAX_DURATION_SECONDS, 45u64)?;
        if max_run == 0 {
            return Err(anyhow!("{ENV_RUN_MAX_DURATION_SECONDS} must be > 0"));
        }
        let dedup_hours = parse_in_range(&var, ENV_DEDUP_WINDOW_HOURS, 48i64, 1, 24 * 30)?;
        let chunk = parse_in_range(&var, ENV_YAHOO_CHUNK_SIZE, 40usize, 5, 350)?;

        let scheduler_enabled = match var(ENV_SCHEDULER_ENABLED) {
            Some(v) => parse_bool(&v)
                .ok_or_else(|| anyhow!("{ENV_SCHEDULER_ENABLED}: not a boolean: {v}"))?,
            None => d.scheduler_enabled,
        };

        let cors_origins = var(ENV_CORS_ORIGINS)
            .map(|v| {
                v.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or(d.cors_origins);

        Ok(Self {
            database_url: var(ENV_DATABASE_URL).unwrap_or(d.database_url),
            tickers_csv_path: var(ENV_TICKERS_CSV_PATH)
                .map(PathBuf::from)
                .unwrap_or(d.tickers_csv_path),
            sources_config_path: var(ENV_SOURCES_CONFIG_PATH).map(PathBuf::from),
            scheduler_enabled,
            ingest_interval: Duration::from_secs(interval),
            request_timeout: Duration::from_secs(timeout),
            fetch_concurrency: concurrency,
            run_max_duration: Duration::from_secs(max_run),
            dedup_window_hours: dedup_hours,
            yahoo_chunk_size: chunk,
            cors_origins,
            default_unmapped_provider: var(ENV_DEFAULT_UNMAPPED_PROVIDER),
        })
    }

    pub fn cors_is_permissive(&self) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == "*")
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(v) => v.parse::<T>().with_context(|| format!("{key}: invalid value {v:?}")),
        None => Ok(default),
    }
}

fn parse_in_range<T, F>(var: &F, key: &str, default: T, min: T, max: T) -> Result<T>
where
    T: FromStr + PartialOrd + std::fmt::Display + Copy,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    let v = parse_or(var, key, default)?;
    if v < min || v > max {
        return Err(anyhow!("{key} must be within {min}..={max} (got {v})"));
    }
    Ok(v)
}

pub(crate) fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}
