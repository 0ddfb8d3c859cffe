//! Journey storage
//!
//! Every status change out of `ongoing` is a conditional UPDATE on the
//! current status, and the insert of a new ongoing journey is conditional on
//! no other ongoing row existing for the rider (backed by a partial unique
//! index). Callers learn whether they won from the returned flag.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{from_db_time, to_db_time, Page};
use crate::error::{is_constraint_violation, StorageError};
use crate::money::Money;

/// Journey lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JourneyStatus {
    Ongoing,
    Completed,
    EmergencyCancelled,
}

impl JourneyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ongoing => "ongoing",
            Self::Completed => "completed",
            Self::EmergencyCancelled => "emergency_cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ongoing" => Some(Self::Ongoing),
            "completed" => Some(Self::Completed),
            "emergency_cancelled" => Some(Self::EmergencyCancelled),
            _ => None,
        }
    }
}

/// Priced breakdown recorded on a completed journey
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FareBreakdown {
    pub origin_code: String,
    pub destination_code: String,
    pub distance_km: u32,
    pub base_fare: Money,
    pub service_charge: Money,
    /// Late-exit surcharge, zero when the rider exits before the deadline
    pub penalty: Money,
    pub total: Money,
}

/// Journey row, with checkpoint names joined in for display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Journey {
    pub id: String,
    pub rider_id: String,
    pub origin_code: String,
    pub origin_name: Option<String>,
    pub origin_time: DateTime<Utc>,
    pub destination_code: Option<String>,
    pub destination_name: Option<String>,
    pub destination_time: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub fare: Option<FareBreakdown>,
    pub status: JourneyStatus,
    pub deadline: DateTime<Utc>,
    pub active: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn conversion_error<E>(err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn optional_time(raw: Option<String>) -> Result<Option<DateTime<Utc>>, rusqlite::Error> {
    raw.as_deref().map(from_db_time).transpose()
}

impl Journey {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        let status_raw: String = row.get("status")?;
        let status = JourneyStatus::parse(&status_raw).ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(0, format!("status={}", status_raw), rusqlite::types::Type::Text)
        })?;

        let fare = row
            .get::<_, Option<String>>("fare_json")?
            .map(|json| serde_json::from_str::<FareBreakdown>(&json))
            .transpose()
            .map_err(conversion_error)?;

        Ok(Self {
            id: row.get("id")?,
            rider_id: row.get("rider_id")?,
            origin_code: row.get("origin_code")?,
            origin_name: row.get("origin_name")?,
            origin_time: from_db_time(&row.get::<_, String>("origin_time")?)?,
            destination_code: row.get("destination_code")?,
            destination_name: row.get("destination_name")?,
            destination_time: optional_time(row.get("destination_time")?)?,
            duration_minutes: row.get("duration_minutes")?,
            fare,
            status,
            deadline: from_db_time(&row.get::<_, String>("deadline")?)?,
            active: row.get("active")?,
            cancelled_at: optional_time(row.get("cancelled_at")?)?,
            created_at: from_db_time(&row.get::<_, String>("created_at")?)?,
            updated_at: from_db_time(&row.get::<_, String>("updated_at")?)?,
        })
    }
}

const JOURNEY_SELECT: &str = "SELECT j.*, o.name AS origin_name, d.name AS destination_name
    FROM journeys j
    LEFT JOIN checkpoints o ON o.code = j.origin_code
    LEFT JOIN checkpoints d ON d.code = j.destination_code";

/// Input for opening a journey
#[derive(Debug, Clone)]
pub struct NewJourney<'a> {
    pub id: &'a str,
    pub rider_id: &'a str,
    pub origin_code: &'a str,
    pub origin_time: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// Result of the conditional insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// The rider already has an ongoing journey
    RiderHasOngoing,
    /// The generated journey id is already in use
    IdTaken,
}

/// Insert an ongoing journey unless the rider already has one
pub fn insert_ongoing(conn: &Connection, new: &NewJourney<'_>) -> Result<InsertOutcome, StorageError> {
    let ts = to_db_time(new.origin_time);
    let result = conn.execute(
        "INSERT INTO journeys (id, rider_id, origin_code, origin_time, status, deadline, active, created_at, updated_at)
         SELECT ?1, ?2, ?3, ?4, 'ongoing', ?5, 1, ?4, ?4
         WHERE NOT EXISTS (
             SELECT 1 FROM journeys WHERE rider_id = ?2 AND status = 'ongoing' AND active = 1
         )",
        params![new.id, new.rider_id, new.origin_code, ts, to_db_time(new.deadline)],
    );

    match result {
        Ok(0) => Ok(InsertOutcome::RiderHasOngoing),
        Ok(_) => Ok(InsertOutcome::Inserted),
        Err(e) if is_constraint_violation(&e) => {
            if get_ongoing(conn, new.rider_id)?.is_some() {
                Ok(InsertOutcome::RiderHasOngoing)
            } else {
                Ok(InsertOutcome::IdTaken)
            }
        }
        Err(e) => Err(StorageError::query("insert journey", e)),
    }
}

/// Get journey by id
pub fn get_journey(conn: &Connection, id: &str) -> Result<Option<Journey>, StorageError> {
    conn.query_row(&format!("{} WHERE j.id = ?", JOURNEY_SELECT), params![id], |row| {
        Journey::from_row(row)
    })
    .optional()
    .map_err(|e| StorageError::query("get journey", e))
}

/// Get the rider's ongoing journey, if any
pub fn get_ongoing(conn: &Connection, rider_id: &str) -> Result<Option<Journey>, StorageError> {
    conn.query_row(
        &format!(
            "{} WHERE j.rider_id = ? AND j.status = 'ongoing' AND j.active = 1",
            JOURNEY_SELECT
        ),
        params![rider_id],
        |row| Journey::from_row(row),
    )
    .optional()
    .map_err(|e| StorageError::query("get ongoing journey", e))
}

/// Fields written when a journey completes
#[derive(Debug, Clone)]
pub struct Completion<'a> {
    pub destination_code: &'a str,
    pub destination_time: DateTime<Utc>,
    pub duration_minutes: i64,
    pub fare: &'a FareBreakdown,
}

/// Transition ongoing -> completed; false if the journey was no longer ongoing
pub fn complete_ongoing(conn: &Connection, journey_id: &str, completion: &Completion<'_>) -> Result<bool, StorageError> {
    let fare_json = serde_json::to_string(completion.fare)?;
    let ts = to_db_time(completion.destination_time);

    let changed = conn
        .execute(
            "UPDATE journeys SET
                destination_code = ?2,
                destination_time = ?3,
                duration_minutes = ?4,
                fare_json = ?5,
                status = 'completed',
                updated_at = ?3
             WHERE id = ?1 AND status = 'ongoing' AND active = 1",
            params![journey_id, completion.destination_code, ts, completion.duration_minutes, fare_json],
        )
        .map_err(|e| StorageError::query("complete journey", e))?;

    Ok(changed == 1)
}

/// Transition ongoing -> emergency_cancelled; false if it was no longer ongoing
pub fn cancel_ongoing(conn: &Connection, journey_id: &str, now: DateTime<Utc>) -> Result<bool, StorageError> {
    let ts = to_db_time(now);
    let changed = conn
        .execute(
            "UPDATE journeys SET status = 'emergency_cancelled', cancelled_at = ?2, updated_at = ?2
             WHERE id = ?1 AND status = 'ongoing' AND active = 1",
            params![journey_id, ts],
        )
        .map_err(|e| StorageError::query("cancel journey", e))?;

    Ok(changed == 1)
}

/// Completed journeys for a rider, most recent exit first
pub fn list_completed(conn: &Connection, rider_id: &str, page: Page) -> Result<Vec<Journey>, StorageError> {
    let mut stmt = conn
        .prepare(&format!(
            "{} WHERE j.rider_id = ? AND j.status = 'completed' AND j.active = 1
             ORDER BY j.destination_time DESC LIMIT ? OFFSET ?",
            JOURNEY_SELECT
        ))
        .map_err(|e| StorageError::query("prepare journey history", e))?;

    let rows = stmt
        .query_map(params![rider_id, page.limit, page.offset], |row| Journey::from_row(row))
        .map_err(|e| StorageError::query("journey history", e))?;

    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| StorageError::query("read journey row", e))
}

/// Number of completed journeys for a rider
pub fn count_completed(conn: &Connection, rider_id: &str) -> Result<u64, StorageError> {
    conn.query_row(
        "SELECT COUNT(*) FROM journeys WHERE rider_id = ? AND status = 'completed' AND active = 1",
        params![rider_id],
        |row| row.get::<_, i64>(0),
    )
    .map(|n| n as u64)
    .map_err(|e| StorageError::query("count completed journeys", e))
}
