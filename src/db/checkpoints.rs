//! Checkpoint CRUD operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{from_db_time, to_db_time, Page};
use crate::error::{is_constraint_violation, StorageError};

/// Canonical form of a checkpoint code
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Checkpoint row from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub code: String,
    pub name: String,
    pub city: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            code: row.get("code")?,
            name: row.get("name")?,
            city: row.get("city")?,
            active: row.get("active")?,
            created_at: from_db_time(&row.get::<_, String>("created_at")?)?,
            updated_at: from_db_time(&row.get::<_, String>("updated_at")?)?,
        })
    }
}

/// Input for creating a checkpoint
#[derive(Debug, Clone, Deserialize)]
pub struct CreateCheckpointInput {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub city: String,
}

/// Insert a checkpoint; code must not already be taken
pub fn create_checkpoint(
    conn: &Connection,
    input: &CreateCheckpointInput,
    now: DateTime<Utc>,
) -> Result<Checkpoint, StorageError> {
    let id = Uuid::new_v4().to_string();
    let code = normalize_code(&input.code);
    let ts = to_db_time(now);

    conn.execute(
        "INSERT INTO checkpoints (id, code, name, city, active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5)",
        params![id, code, input.name, input.city, ts],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            StorageError::InvalidInput(format!("Checkpoint with code {} already exists", code))
        } else {
            StorageError::query("insert checkpoint", e)
        }
    })?;

    get_checkpoint(conn, &id)?
        .ok_or_else(|| StorageError::Internal("Failed to retrieve created checkpoint".into()))
}

/// Get checkpoint by id, including soft-deleted ones
pub fn get_checkpoint(conn: &Connection, id: &str) -> Result<Option<Checkpoint>, StorageError> {
    conn.query_row("SELECT * FROM checkpoints WHERE id = ?", params![id], |row| {
        Checkpoint::from_row(row)
    })
    .optional()
    .map_err(|e| StorageError::query("get checkpoint", e))
}

/// Get an active checkpoint by code
pub fn get_active_by_code(conn: &Connection, code: &str) -> Result<Option<Checkpoint>, StorageError> {
    let code = normalize_code(code);
    debug!(code = %code, "Looking up checkpoint");

    conn.query_row(
        "SELECT * FROM checkpoints WHERE code = ? AND active = 1",
        params![code],
        |row| Checkpoint::from_row(row),
    )
    .optional()
    .map_err(|e| StorageError::query("get checkpoint by code", e))
}

/// List active checkpoints ordered by name
pub fn list_checkpoints(conn: &Connection, page: Page) -> Result<Vec<Checkpoint>, StorageError> {
    let mut stmt = conn
        .prepare("SELECT * FROM checkpoints WHERE active = 1 ORDER BY name LIMIT ? OFFSET ?")
        .map_err(|e| StorageError::query("prepare list checkpoints", e))?;

    let rows = stmt
        .query_map(params![page.limit, page.offset], |row| Checkpoint::from_row(row))
        .map_err(|e| StorageError::query("list checkpoints", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::query("read checkpoint row", e))
}

/// Search active checkpoints by name, city or code
pub fn search_checkpoints(conn: &Connection, query: &str, limit: u32) -> Result<Vec<Checkpoint>, StorageError> {
    let pattern = format!("%{}%", query.trim());
    let mut stmt = conn
        .prepare(
            "SELECT * FROM checkpoints
             WHERE active = 1 AND (name LIKE ?1 OR city LIKE ?1 OR code LIKE UPPER(?1))
             ORDER BY name LIMIT ?2",
        )
        .map_err(|e| StorageError::query("prepare search checkpoints", e))?;

    let rows = stmt
        .query_map(params![pattern, limit], |row| Checkpoint::from_row(row))
        .map_err(|e| StorageError::query("search checkpoints", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::query("read checkpoint row", e))
}

/// Update name and/or city
pub fn update_checkpoint(
    conn: &Connection,
    id: &str,
    name: Option<&str>,
    city: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Option<Checkpoint>, StorageError> {
    let changed = conn
        .execute(
            "UPDATE checkpoints
             SET name = COALESCE(?2, name), city = COALESCE(?3, city), updated_at = ?4
             WHERE id = ?1",
            params![id, name, city, to_db_time(now)],
        )
        .map_err(|e| StorageError::query("update checkpoint", e))?;

    if changed == 0 {
        return Ok(None);
    }
    get_checkpoint(conn, id)
}

/// Soft delete; returns false when nothing active matched
pub fn soft_delete_checkpoint(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
    let ts = to_db_time(now);
    let changed = conn
        .execute(
            "UPDATE checkpoints SET active = 0, deleted_at = ?2, updated_at = ?2
             WHERE id = ?1 AND active = 1",
            params![id, ts],
        )
        .map_err(|e| StorageError::query("soft delete checkpoint", e))?;

    Ok(changed > 0)
}
