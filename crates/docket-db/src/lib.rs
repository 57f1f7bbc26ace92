//! docket-db: SQLite storage + migration engine for the docket settlement
//! core.
//!
//! One logical database holds the four table groups the engine needs:
//! budgets + adjustments, the financial ledger, enforcement audit rows, and
//! the rate tables, plus the invoices they settle into. Repositories operate
//! on a borrowed connection so they compose inside a single transaction.

pub mod budget_repository;
pub mod enforcement_repository;
pub mod invoice_repository;
pub mod ledger_repository;
pub mod rate_repository;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;

include!(concat!(env!("OUT_DIR"), "/migrations.rs"));

#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: 5000,
        }
    }
}

#[derive(Debug)]
pub struct Db {
    conn: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    pub version: i32,
    pub description: String,
    pub applied: bool,
    pub applied_at: String,
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("open database: {0}")]
    Open(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("migration {version} missing {direction} sql")]
    MissingSQL {
        version: i32,
        direction: &'static str,
    },
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Transaction(String),
    #[error("case budget not found")]
    BudgetNotFound,
    #[error("service budget limit not found")]
    ServiceLimitNotFound,
    #[error("financial entry not found")]
    EntryNotFound,
    #[error("invoice not found")]
    InvoiceNotFound,
    #[error("rate not found")]
    RateNotFound,
}

impl DbError {
    /// Whether this error is SQLite reporting a held lock; callers may retry.
    pub fn is_busy(&self) -> bool {
        let msg = self.to_string().to_lowercase();
        msg.contains("database is locked")
            || msg.contains("database is busy")
            || msg.contains("sqlite_busy")
    }
}

impl From<docket_core::error::CoreError> for DbError {
    fn from(err: docket_core::error::CoreError) -> Self {
        match err {
            docket_core::error::CoreError::Validation(msg) => Self::Validation(msg),
            docket_core::error::CoreError::NotFound(msg) => Self::Validation(msg),
            docket_core::error::CoreError::Internal(msg) => Self::Transaction(msg),
        }
    }
}

impl Db {
    const DEFAULT_RETRY_ATTEMPTS: usize = 3;
    const DEFAULT_RETRY_BACKOFF_MS: u64 = 50;

    pub fn open(cfg: Config) -> Result<Self, DbError> {
        ensure_parent_dir(&cfg.path)?;
        let conn = Connection::open(&cfg.path)?;
        conn.busy_timeout(Duration::from_millis(cfg.busy_timeout_ms))?;
        // Best-effort: ignore pragma errors on older SQLite builds.
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "foreign_keys", "ON");
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        Ok(Self { conn })
    }

    pub fn migrate_up(&mut self) -> Result<usize, DbError> {
        self.ensure_schema_version_table()?;
        let current = self.current_version()?;

        let mut applied = 0usize;
        for m in MIGRATIONS {
            if m.version <= current {
                continue;
            }
            if m.up_sql.is_empty() {
                return Err(DbError::MissingSQL {
                    version: m.version,
                    direction: "up",
                });
            }

            let tx = self.conn.transaction()?;
            tx.execute_batch(m.up_sql)?;
            tx.execute(
                "INSERT INTO schema_version (version, description) VALUES (?1, ?2)",
                params![m.version, m.description],
            )?;
            tx.commit()?;
            applied += 1;
        }
        Ok(applied)
    }

    pub fn migrate_down(&mut self, steps: i32) -> Result<usize, DbError> {
        self.ensure_schema_version_table()?;
        let current = self.current_version()?;
        if current == 0 || steps <= 0 {
            return Ok(0);
        }

        let mut to_rollback = Vec::new();
        for m in MIGRATIONS.iter().rev() {
            if m.version <= current {
                to_rollback.push(*m);
                if to_rollback.len() >= steps as usize {
                    break;
                }
            }
        }

        let mut rolled_back = 0usize;
        for m in to_rollback {
            if m.down_sql.is_empty() {
                return Err(DbError::MissingSQL {
                    version: m.version,
                    direction: "down",
                });
            }

            let tx = self.conn.transaction()?;
            tx.execute_batch(m.down_sql)?;
            tx.execute(
                "DELETE FROM schema_version WHERE version = ?1",
                params![m.version],
            )?;
            tx.commit()?;
            rolled_back += 1;
        }

        Ok(rolled_back)
    }

    pub fn migrate_to(&mut self, target_version: i32) -> Result<(), DbError> {
        self.ensure_schema_version_table()?;
        let current = self.current_version()?;
        if target_version == current {
            return Ok(());
        }

        if target_version > current {
            for m in MIGRATIONS {
                if m.version <= current || m.version > target_version {
                    continue;
                }
                if m.up_sql.is_empty() {
                    return Err(DbError::MissingSQL {
                        version: m.version,
                        direction: "up",
                    });
                }

                let tx = self.conn.transaction()?;
                tx.execute_batch(m.up_sql)?;
                tx.execute(
                    "INSERT INTO schema_version (version, description) VALUES (?1, ?2)",
                    params![m.version, m.description],
                )?;
                tx.commit()?;
            }
        } else {
            for m in MIGRATIONS.iter().rev() {
                if m.version <= target_version || m.version > current {
                    continue;
                }
                if m.down_sql.is_empty() {
                    return Err(DbError::MissingSQL {
                        version: m.version,
                        direction: "down",
                    });
                }

                let tx = self.conn.transaction()?;
                tx.execute_batch(m.down_sql)?;
                tx.execute(
                    "DELETE FROM schema_version WHERE version = ?1",
                    params![m.version],
                )?;
                tx.commit()?;
            }
        }
        Ok(())
    }

    pub fn migration_status(&mut self) -> Result<Vec<MigrationStatus>, DbError> {
        self.ensure_schema_version_table()?;

        let mut applied_at: BTreeMap<i32, String> = BTreeMap::new();
        let mut stmt = self
            .conn
            .prepare("SELECT version, applied_at FROM schema_version ORDER BY version")?;
        let rows = stmt.query_map([], |row| {
            let version: i32 = row.get(0)?;
            let stamp: String = row.get(1)?;
            Ok((version, stamp))
        })?;
        for row in rows {
            let (version, stamp) = row?;
            applied_at.insert(version, stamp);
        }

        let mut status = Vec::with_capacity(MIGRATIONS.len());
        for m in MIGRATIONS {
            let stamp = applied_at.get(&m.version).cloned().unwrap_or_default();
            status.push(MigrationStatus {
                version: m.version,
                description: m.description.to_string(),
                applied: applied_at.contains_key(&m.version),
                applied_at: stamp,
            });
        }
        Ok(status)
    }

    pub fn schema_version(&self) -> Result<i32, DbError> {
        let version: Option<i32> = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0))
    }

    fn ensure_schema_version_table(&self) -> Result<(), DbError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (\n\
                version INTEGER PRIMARY KEY,\n\
                applied_at TEXT NOT NULL DEFAULT (datetime('now')),\n\
                description TEXT\n\
             );",
        )?;
        Ok(())
    }

    /// Returns a reference to the underlying SQLite connection.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Runs `f` inside a deferred SQLite transaction: explicit rollback on
    /// error, explicit commit on success.
    pub fn transaction<T>(
        &mut self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let tx = self.conn.transaction()?;
        Self::run_in_tx(tx, f)
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The writer lock is taken before `f` runs, so an evaluate-then-write
    /// sequence (consumption read, limit comparison, audit write, mutation)
    /// is serialized against every concurrent writer. Waiting is bounded by
    /// the connection's busy timeout; on expiry the caller sees a busy error.
    pub fn write_transaction<T>(
        &mut self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Self::run_in_tx(tx, f)
    }

    fn run_in_tx<T>(
        tx: rusqlite::Transaction<'_>,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        match f(&tx) {
            Ok(v) => {
                tx.commit()?;
                Ok(v)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback() {
                    return Err(DbError::Transaction(format!(
                        "rollback failed: {rb} (original error: {e})"
                    )));
                }
                Err(e)
            }
        }
    }

    /// Retries a write transaction when SQLite reports busy/locked.
    pub fn write_transaction_with_retry<T>(
        &mut self,
        mut max_attempts: usize,
        mut base_backoff: Duration,
        mut f: impl FnMut(&rusqlite::Transaction<'_>) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        if max_attempts == 0 {
            max_attempts = Self::DEFAULT_RETRY_ATTEMPTS;
        }
        if base_backoff.is_zero() {
            base_backoff = Duration::from_millis(Self::DEFAULT_RETRY_BACKOFF_MS);
        }

        let mut backoff = base_backoff;
        for attempt in 1..=max_attempts {
            let result = self.write_transaction(|tx| f(tx));
            match result {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt >= max_attempts || !e.is_busy() {
                        return Err(e);
                    }
                    std::thread::sleep(backoff);
                    backoff = backoff.saturating_mul(2);
                }
            }
        }

        unreachable!("loop returns on success or final error")
    }

    fn current_version(&self) -> Result<i32, DbError> {
        let version: Option<i32> = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.unwrap_or(0))
    }
}

/// Current UTC time as an RFC 3339 string (second precision, `Z` suffix).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn is_unique_constraint_error(err: &rusqlite::Error) -> bool {
    err.to_string().contains("UNIQUE constraint failed")
}

pub(crate) fn to_sql_conversion_error(
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn nullable_string(value: &str) -> Option<&str> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn ensure_parent_dir(path: &Path) -> Result<(), std::io::Error> {
    let parent = match path.parent() {
        Some(parent) => parent,
        None => return Ok(()),
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(parent)
}
