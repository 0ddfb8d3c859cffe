//! Fare rule storage
//!
//! Rules are keyed by the directed (origin, destination) pair. Lookups here
//! are single-direction; the reverse-pair fallback belongs to the resolver.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{from_db_time, to_db_time, Page};
use crate::error::StorageError;
use crate::money::Money;

/// Fare rule row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FareRule {
    pub origin_code: String,
    pub destination_code: String,
    pub distance_km: u32,
    pub base_fare: Money,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FareRule {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            origin_code: row.get("origin_code")?,
            destination_code: row.get("destination_code")?,
            distance_km: row.get("distance_km")?,
            base_fare: Money::from_minor(row.get("base_fare_minor")?),
            active: row.get("active")?,
            created_at: from_db_time(&row.get::<_, String>("created_at")?)?,
            updated_at: from_db_time(&row.get::<_, String>("updated_at")?)?,
        })
    }
}

/// Active rule stored exactly in the (origin, destination) direction
pub fn find_active(conn: &Connection, origin: &str, destination: &str) -> Result<Option<FareRule>, StorageError> {
    conn.query_row(
        "SELECT * FROM fare_rules WHERE origin_code = ? AND destination_code = ? AND active = 1",
        params![origin, destination],
        |row| FareRule::from_row(row),
    )
    .optional()
    .map_err(|e| StorageError::query("find fare rule", e))
}

/// Create or replace the rule for a directed pair, reactivating it
pub fn upsert_rule(
    conn: &Connection,
    origin: &str,
    destination: &str,
    distance_km: u32,
    base_fare: Money,
    now: DateTime<Utc>,
) -> Result<FareRule, StorageError> {
    conn.execute(
        "INSERT INTO fare_rules (origin_code, destination_code, distance_km, base_fare_minor, active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)
         ON CONFLICT (origin_code, destination_code) DO UPDATE SET
            distance_km = excluded.distance_km,
            base_fare_minor = excluded.base_fare_minor,
            active = 1,
            updated_at = excluded.updated_at",
        params![origin, destination, distance_km, base_fare.minor(), to_db_time(now)],
    )
    .map_err(|e| StorageError::query("upsert fare rule", e))?;

    find_active(conn, origin, destination)?
        .ok_or_else(|| StorageError::Internal("Failed to retrieve upserted fare rule".into()))
}

/// Deactivate a directed rule; returns false if none was active
pub fn deactivate_rule(
    conn: &Connection,
    origin: &str,
    destination: &str,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let changed = conn
        .execute(
            "UPDATE fare_rules SET active = 0, updated_at = ?3
             WHERE origin_code = ?1 AND destination_code = ?2 AND active = 1",
            params![origin, destination, to_db_time(now)],
        )
        .map_err(|e| StorageError::query("deactivate fare rule", e))?;

    Ok(changed > 0)
}

/// List active rules ordered by origin then destination
pub fn list_rules(conn: &Connection, page: Page) -> Result<Vec<FareRule>, StorageError> {
    let mut stmt = conn
        .prepare(
            "SELECT * FROM fare_rules WHERE active = 1
             ORDER BY origin_code, destination_code LIMIT ? OFFSET ?",
        )
        .map_err(|e| StorageError::query("prepare list fare rules", e))?;

    let rows = stmt
        .query_map(params![page.limit, page.offset], |row| FareRule::from_row(row))
        .map_err(|e| StorageError::query("list fare rules", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::query("read fare rule row", e))
}
