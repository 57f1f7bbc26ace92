//! Configuration types for the docket engine and CLI.
//!
//! Defaults-first structs with environment variable overrides. The engine
//! itself only needs the database location and lock-wait budget; the
//! enforcement section carries the default warning threshold applied when a
//! service-level limit is created without one.

use std::path::PathBuf;

/// Root configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub enforcement: EnforcementConfig,
}

/// Database location and lock behavior.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Bounded wait for the writer lock, in milliseconds.
    pub busy_timeout_ms: u64,
}

/// Enforcement tuning.
#[derive(Debug, Clone)]
pub struct EnforcementConfig {
    /// Warning threshold (percent of a service-level cap) applied when a
    /// limit is created without an explicit threshold.
    pub default_warning_threshold_pct: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                path: default_db_path(),
                busy_timeout_ms: 5000,
            },
            enforcement: EnforcementConfig {
                default_warning_threshold_pct: 80,
            },
        }
    }
}

impl Config {
    /// Default configuration with environment overrides applied:
    /// `DOCKET_DB` (path), `DOCKET_DB_BUSY_TIMEOUT_MS`, `DOCKET_WARN_PCT`.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(path) = std::env::var("DOCKET_DB") {
            if !path.trim().is_empty() {
                cfg.database.path = PathBuf::from(path);
            }
        }
        if let Ok(timeout) = std::env::var("DOCKET_DB_BUSY_TIMEOUT_MS") {
            if let Ok(ms) = timeout.trim().parse::<u64>() {
                cfg.database.busy_timeout_ms = ms;
            }
        }
        if let Ok(pct) = std::env::var("DOCKET_WARN_PCT") {
            if let Ok(pct) = pct.trim().parse::<i64>() {
                if (1..=100).contains(&pct) {
                    cfg.enforcement.default_warning_threshold_pct = pct;
                }
            }
        }
        cfg
    }
}

fn default_db_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".local/share/docket/docket.sqlite")
}
