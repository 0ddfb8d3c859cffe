//! SQLite database module for gate, fare and ledger state
//!
//! One connection, one lock. Every statement that guards an invariant is a
//! single conditional write, so correctness does not depend on the lock
//! alone; the lock only bounds how long a caller can wait for storage.
//!
//! ## Tables
//!
//! - `checkpoints` - Gate locations (code unique, soft-deletable)
//! - `fare_rules` - Directed (origin, destination) prices
//! - `journeys` - Trips; at most one `ongoing` row per rider
//! - `ledger_accounts` - Rider balances in minor units
//! - `ledger_transactions` - Append-only credit/debit log

pub mod schema;
pub mod checkpoints;
pub mod fare_rules;
pub mod journeys;
pub mod accounts;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, info};

use crate::error::StorageError;

/// SQLite database for the settlement engine
pub struct GateDb {
    conn: Mutex<Connection>,
    timeout: Duration,
}

impl GateDb {
    /// Open or create the database file inside `storage_dir`
    pub fn open(db_path: &Path, timeout: Duration) -> Result<Self, StorageError> {
        info!("Opening SQLite database at {:?}", db_path);

        let conn = Connection::open(db_path).map_err(|e| StorageError::query("open database", e))?;

        // WAL keeps history reads from blocking gate writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StorageError::query("set pragmas", e))?;

        Self::from_connection(conn, timeout)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory(timeout: Duration) -> Result<Self, StorageError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::query("open in-memory database", e))?;

        Self::from_connection(conn, timeout)
    }

    fn from_connection(conn: Connection, timeout: Duration) -> Result<Self, StorageError> {
        conn.busy_timeout(timeout)
            .map_err(|e| StorageError::query("set busy timeout", e))?;

        schema::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
            timeout,
        })
    }

    /// Bound applied to lock acquisition and SQLite busy waits
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run a read against the connection
    pub fn with_conn<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StorageError>,
    {
        let conn = self.conn.try_lock_for(self.timeout).ok_or_else(|| {
            StorageError::Timeout(format!("connection lock not acquired within {:?}", self.timeout))
        })?;
        f(&conn)
    }

    /// Run writes inside one IMMEDIATE transaction
    ///
    /// Commits when `f` returns `Ok`; any `Err` rolls every statement back.
    pub fn with_tx<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
        E: From<StorageError>,
    {
        let mut conn = self.conn.try_lock_for(self.timeout).ok_or_else(|| {
            StorageError::Timeout(format!("connection lock not acquired within {:?}", self.timeout))
        })?;

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StorageError::query("begin transaction", e))?;

        let value = f(&tx)?;

        tx.commit().map_err(|e| StorageError::query("commit transaction", e))?;
        Ok(value)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, StorageError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, StorageError> {
                conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(|e| StorageError::query("count rows", e))
            };

            let ongoing_journeys: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM journeys WHERE status = 'ongoing' AND active = 1",
                    [],
                    |row| row.get(0),
                )
                .map_err(|e| StorageError::query("count ongoing journeys", e))?;

            Ok(DbStats {
                checkpoint_count: count("checkpoints")?,
                fare_rule_count: count("fare_rules")?,
                journey_count: count("journeys")?,
                ongoing_journey_count: ongoing_journeys as u64,
                account_count: count("ledger_accounts")?,
                transaction_count: count("ledger_transactions")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub checkpoint_count: u64,
    pub fare_rule_count: u64,
    pub journey_count: u64,
    pub ongoing_journey_count: u64,
    pub account_count: u64,
    pub transaction_count: u64,
}

// ============================================================================
// Timestamp Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

/// Format a timestamp for a TEXT column; fixed width so text order is time order
pub fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a TEXT timestamp column
pub(crate) fn from_db_time(raw: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

/// Limit/offset pair for list reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Page {
    pub offset: u32,
    pub limit: u32,
}

impl Page {
    pub fn new(offset: u32, limit: u32) -> Self {
        Self { offset, limit }
    }

    pub fn first(limit: u32) -> Self {
        Self { offset: 0, limit }
    }
}

// Re-exports
pub use accounts::{AccountRow, AccountStatus, LedgerEntry, TransactionDirection};
pub use checkpoints::{Checkpoint, CreateCheckpointInput};
pub use fare_rules::FareRule;
pub use journeys::{FareBreakdown, Journey, JourneyStatus};
