use std::{env, str::FromStr, time::Duration};

use tracing::warn;

pub const MEMORY_DATABASE_URL: &str = "sqlite::memory:";

const DEFAULT_MAX_CALL_DEPTH: usize = 1_000;
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Runtime configuration for the engine and its bundled SQLite store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// `sqlite::memory:` or a directory holding one database file per dataset.
    pub database_url: String,
    pub max_call_depth: usize,
    pub busy_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: MEMORY_DATABASE_URL.to_string(),
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
        }
    }
}

impl EngineConfig {
    /// Reads `STRATA_DATABASE_URL`, `STRATA_MAX_CALL_DEPTH` and
    /// `STRATA_BUSY_TIMEOUT_MS`. Malformed values keep the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let database_url = lookup("STRATA_DATABASE_URL")
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.database_url);
        let max_call_depth = parse_or(
            "STRATA_MAX_CALL_DEPTH",
            lookup("STRATA_MAX_CALL_DEPTH"),
            defaults.max_call_depth,
        );
        let busy_timeout_ms = parse_or(
            "STRATA_BUSY_TIMEOUT_MS",
            lookup("STRATA_BUSY_TIMEOUT_MS"),
            DEFAULT_BUSY_TIMEOUT_MS,
        );
        Self {
            database_url,
            max_call_depth,
            busy_timeout: Duration::from_millis(busy_timeout_ms),
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    pub fn is_memory(&self) -> bool {
        self.database_url == MEMORY_DATABASE_URL
    }
}

fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            warn!(key, value = %raw, %default, "ignoring malformed configuration value");
            default
        }
    }
}
