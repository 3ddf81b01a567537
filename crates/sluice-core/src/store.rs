//! `SQLite`-backed durable store shared by queues and task ledgers.
//!
//! A [`Store`] is a cloneable handle over one connection. All queues opened
//! from the same handle share that connection, which is what lets a
//! [`QueuePair`](crate::queue::QueuePair) answer its anti-join with a single
//! query. Other workers open their own `Store` on the same file; `SQLite`
//! file locking (WAL mode, busy timeout) serialises their writes.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Deserialize;

use crate::domain::{QueueError, Result};
use crate::ledger::TaskLedger;
use crate::ports::{Clock, SystemClock};
use crate::queue::{AckQueue, QueueOptions};

/// Connection-level settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// How long a writer waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
        }
    }
}

struct StoreInner {
    conn: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    path: Option<PathBuf>,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("path", &self.inner.path).finish()
    }
}

impl Store {
    /// Open or create a database file with default options and the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Io`] if the directory can't be created, or
    /// [`QueueError::StoreUnavailable`] if the database can't be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, &StoreOptions::default(), Arc::new(SystemClock))
    }

    pub fn open_with(
        path: impl AsRef<Path>,
        options: &StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Ok(Self::from_connection(conn, clock, Some(path.to_path_buf())))
    }

    /// Create an in-memory store (for testing). Only handles cloned from this
    /// one can see its tables.
    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::from_connection(conn, clock, None))
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                clock,
                path,
            }),
        }
    }

    /// Open (creating if needed) a named queue in this store.
    pub fn queue(&self, name: &str, options: QueueOptions) -> Result<Arc<AckQueue>> {
        AckQueue::open(self.clone(), name, options).map(Arc::new)
    }

    /// Open the task ledger of one stage.
    pub fn ledger(&self, stage: &str) -> Result<TaskLedger> {
        TaskLedger::open(self.clone(), stage)
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Whether two handles reach the same database.
    pub fn same_database(&self, other: &Store) -> bool {
        if Arc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        match (self.path(), other.path()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Acquire the connection lock.
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.inner.conn.lock().map_err(|_| QueueError::LockPoisoned)
    }
}

/// Validate a table-level name (queue or stage).
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.to_ascii_lowercase().starts_with("sqlite_")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(QueueError::InvalidName(name.to_string()))
    }
}

/// Quote an identifier that has already passed validation.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Store timestamps as REAL unix seconds with microsecond precision.
pub(crate) fn to_unix(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

pub(crate) fn from_unix(secs: f64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
        .ok_or_else(|| QueueError::Corrupt(format!("timestamp out of range: {secs}")))
}

/// `SQLite` reports this when two writers race to add the same column.
pub(crate) fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    matches!(err, rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("duplicate column name"))
}
