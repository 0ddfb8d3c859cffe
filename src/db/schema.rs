//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::StorageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        create_tables(conn)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating schema from v{} to v{}", current_version, SCHEMA_VERSION);
        migrate_schema(conn, current_version)?;
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32, StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| StorageError::query("create schema_version table", e))?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(StorageError::query("read schema_version", other)),
        })?;

    Ok(version.unwrap_or(0))
}

/// Set schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<(), StorageError> {
    conn.execute("DELETE FROM schema_version", [])
        .map_err(|e| StorageError::query("clear schema_version", e))?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])
        .map_err(|e| StorageError::query("set schema_version", e))?;
    Ok(())
}

/// Create all tables
fn create_tables(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(CHECKPOINT_SCHEMA)
        .map_err(|e| StorageError::query("create checkpoint tables", e))?;

    conn.execute_batch(JOURNEY_SCHEMA)
        .map_err(|e| StorageError::query("create journey tables", e))?;

    conn.execute_batch(LEDGER_SCHEMA)
        .map_err(|e| StorageError::query("create ledger tables", e))?;

    conn.execute_batch(INDEXES_SCHEMA)
        .map_err(|e| StorageError::query("create indexes", e))?;

    Ok(())
}

/// Migrate schema from older version
fn migrate_schema(conn: &Connection, from_version: i32) -> Result<(), StorageError> {
    if from_version < 2 {
        info!("Migration v1 -> v2: fare breakdown on ledger transactions");
        conn.execute_batch("ALTER TABLE ledger_transactions ADD COLUMN fare_json TEXT;")
            .map_err(|e| StorageError::query("add ledger_transactions.fare_json", e))?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Checkpoints and fare rules
const CHECKPOINT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS checkpoints (
    id TEXT PRIMARY KEY NOT NULL,
    code TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    city TEXT NOT NULL DEFAULT '',
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    deleted_at TEXT
);

-- Stored directionally, resolved in both directions
CREATE TABLE IF NOT EXISTS fare_rules (
    origin_code TEXT NOT NULL,
    destination_code TEXT NOT NULL,
    distance_km INTEGER NOT NULL CHECK (distance_km > 0),
    base_fare_minor INTEGER NOT NULL CHECK (base_fare_minor > 0),
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (origin_code, destination_code)
);
"#;

/// Journeys
const JOURNEY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS journeys (
    id TEXT PRIMARY KEY NOT NULL,
    rider_id TEXT NOT NULL,
    origin_code TEXT NOT NULL,
    origin_time TEXT NOT NULL,
    destination_code TEXT,
    destination_time TEXT,
    duration_minutes INTEGER,
    -- FareBreakdown as JSON, NULL until completed
    fare_json TEXT,
    status TEXT NOT NULL DEFAULT 'ongoing'
        CHECK (status IN ('ongoing', 'completed', 'emergency_cancelled')),
    deadline TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    cancelled_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Ledger accounts and their transaction log
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_accounts (
    rider_id TEXT PRIMARY KEY NOT NULL,
    account_number TEXT NOT NULL UNIQUE,
    balance_minor INTEGER NOT NULL DEFAULT 0 CHECK (balance_minor >= 0),
    currency TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'inactive' CHECK (status IN ('inactive', 'active')),
    daily_limit_minor INTEGER NOT NULL,
    monthly_limit_minor INTEGER NOT NULL,
    single_transaction_limit_minor INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    activated_at TEXT
);

CREATE TABLE IF NOT EXISTS ledger_transactions (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    rider_id TEXT NOT NULL,
    direction TEXT NOT NULL CHECK (direction IN ('credit', 'debit')),
    amount_minor INTEGER NOT NULL CHECK (amount_minor > 0),
    balance_after_minor INTEGER NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    reference TEXT NOT NULL DEFAULT '',
    -- FareBreakdown as JSON on fare debits, NULL otherwise
    fare_json TEXT,
    status TEXT NOT NULL DEFAULT 'completed',
    created_at TEXT NOT NULL,
    FOREIGN KEY (rider_id) REFERENCES ledger_accounts(rider_id)
);
"#;

/// Index definitions for fast queries
const INDEXES_SCHEMA: &str = r#"
-- One ongoing journey per rider, enforced by the storage engine
CREATE UNIQUE INDEX IF NOT EXISTS idx_journeys_one_ongoing
    ON journeys(rider_id) WHERE status = 'ongoing' AND active = 1;

CREATE INDEX IF NOT EXISTS idx_journeys_rider_status ON journeys(rider_id, status);
CREATE INDEX IF NOT EXISTS idx_journeys_destination_time ON journeys(destination_time);

CREATE INDEX IF NOT EXISTS idx_checkpoints_name ON checkpoints(name);
CREATE INDEX IF NOT EXISTS idx_fare_rules_destination ON fare_rules(destination_code, origin_code);

CREATE INDEX IF NOT EXISTS idx_ledger_transactions_rider ON ledger_transactions(rider_id, seq);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_v1_database_gains_fare_column() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE ledger_transactions (seq INTEGER PRIMARY KEY, id TEXT NOT NULL);
             CREATE TABLE schema_version (version INTEGER NOT NULL);
             INSERT INTO schema_version (version) VALUES (1);",
        )
        .unwrap();

        init_schema(&conn).unwrap();

        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
        conn.execute("INSERT INTO ledger_transactions (id, fare_json) VALUES ('t1', '{}')", [])
            .unwrap();
    }

    #[test]
    fn test_second_ongoing_row_rejected_by_index() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        let insert = |id: &str, status: &str| {
            conn.execute(
                "INSERT INTO journeys (id, rider_id, origin_code, origin_time, status, deadline, created_at, updated_at)
                 VALUES (?1, 'rider-1', 'STN-A', 't', ?2, 't', 't', 't')",
                rusqlite::params![id, status],
            )
        };

        insert("j1", "ongoing").unwrap();
        insert("j2", "completed").unwrap();
        assert!(insert("j3", "ongoing").is_err());
    }

    #[test]
    fn test_negative_balance_rejected_by_check() {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();

        conn.execute(
            "INSERT INTO ledger_accounts (rider_id, account_number, balance_minor, currency,
                daily_limit_minor, monthly_limit_minor, single_transaction_limit_minor, created_at, updated_at)
             VALUES ('r1', 'WAL00000001', 100, 'INR', 1, 1, 1, 't', 't')",
            [],
        )
        .unwrap();

        let result = conn.execute(
            "UPDATE ledger_accounts SET balance_minor = balance_minor - 500 WHERE rider_id = 'r1'",
            [],
        );
        assert!(result.is_err());
    }
}
