//! SQLite store shared by the services and the worker.
//!
//! Every process opens its own [`Store`]; cross-process consistency comes
//! from SQLite itself. Status transitions and leaderboard writes run inside
//! `IMMEDIATE` transactions so two workers never interleave a
//! read-then-write on the same rows.

pub mod imports;
pub mod leaderboard;
pub mod runs;
pub mod strategies;

pub use imports::{ImportStatus, PriceImport};

use std::path::{Path, PathBuf};
use std::time::Duration;

use ax_types::{AxError, AxResult, StoreError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS strategies (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    source_code TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_strategies_owner ON strategies(owner);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    strategy_id TEXT NOT NULL,
    snapshot TEXT NOT NULL,
    status TEXT NOT NULL,
    parameters TEXT NOT NULL,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    log_text TEXT,
    strategy_logs TEXT NOT NULL DEFAULT '[]',
    metrics TEXT,
    events TEXT NOT NULL DEFAULT '{}',
    price_snapshot TEXT NOT NULL DEFAULT '[]',
    chart_png BLOB
);
CREATE INDEX IF NOT EXISTS idx_runs_owner ON runs(owner);
CREATE INDEX IF NOT EXISTS idx_runs_strategy ON runs(strategy_id);

CREATE TABLE IF NOT EXISTS leaderboard (
    category TEXT PRIMARY KEY,
    strategy_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    return_pct REAL,
    win_rate_pct REAL,
    sharpe_ratio REAL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS price_imports (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    owner TEXT NOT NULL,
    name TEXT NOT NULL,
    asset TEXT NOT NULL,
    interval TEXT NOT NULL,
    start_date TEXT,
    end_date TEXT,
    status TEXT NOT NULL,
    error TEXT,
    first_bar TEXT,
    last_bar TEXT,
    bar_count INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS price_bars (
    import_id INTEGER NOT NULL REFERENCES price_imports(id) ON DELETE CASCADE,
    timestamp TEXT NOT NULL,
    open REAL NOT NULL,
    high REAL NOT NULL,
    low REAL NOT NULL,
    close REAL NOT NULL,
    volume REAL NOT NULL,
    adj_close REAL NOT NULL,
    UNIQUE (import_id, timestamp)
);
";

/// How long a connection waits on another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (creating if needed) the database file and apply the schema.
    pub fn open<P: AsRef<Path>>(path: P) -> AxResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path).map_err(connection_error)?;
        // WAL lets readers poll status while a worker holds the write lock.
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(connection_error)?;
        let store = Self::init(conn, Some(path))?;
        info!(path = ?store.path, "Opened store");
        Ok(store)
    }

    pub fn open_in_memory() -> AxResult<Self> {
        let conn = Connection::open_in_memory().map_err(connection_error)?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> AxResult<Self> {
        conn.busy_timeout(BUSY_TIMEOUT).map_err(connection_error)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(connection_error)?;
        conn.execute_batch(SCHEMA).map_err(query_error("schema"))?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn connection_error(err: rusqlite::Error) -> AxError {
    StoreError::Connection {
        message: err.to_string(),
    }
    .into()
}

pub(crate) fn query_error(query: &'static str) -> impl Fn(rusqlite::Error) -> AxError {
    move |err| {
        StoreError::QueryFailed {
            query: query.to_string(),
            error: err.to_string(),
        }
        .into()
    }
}

pub(crate) fn not_found(entity: &str, id: impl ToString) -> AxError {
    StoreError::NotFound {
        entity: entity.to_string(),
        id: id.to_string(),
    }
    .into()
}

pub(crate) fn corrupt(message: String) -> AxError {
    StoreError::Corrupt { message }.into()
}

pub(crate) fn parse_time(value: &str) -> AxResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| corrupt(format!("bad timestamp '{}': {}", value, err)))
}

pub(crate) fn parse_uuid(value: &str) -> AxResult<Uuid> {
    Uuid::parse_str(value).map_err(|err| corrupt(format!("bad id '{}': {}", value, err)))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use ax_types::{Run, RunParameters, StrategySpec};

    pub const CROSS_SOURCE: &str = "import backtrader as bt\n\nclass Cross(bt.Strategy):\n    def next(self):\n        pass\n";

    pub fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("arbitrex.db")).unwrap();
        (dir, store)
    }

    pub fn seeded_run(store: &Store) -> Run {
        let strategy = StrategySpec::new("alice", "Cross", "", CROSS_SOURCE);
        store.insert_strategy(&strategy).unwrap();
        let run = Run::new("alice", &strategy, RunParameters::default());
        store.insert_run(&run).unwrap();
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db.sqlite");
        let store = Store::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
        assert!(path.exists());
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let (dir, store) = testing::temp_store();
        drop(store);
        Store::open(dir.path().join("arbitrex.db")).unwrap();
    }
}
