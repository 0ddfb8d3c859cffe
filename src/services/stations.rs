//! Station directory
//!
//! The gate only needs [`StationDirectory::lookup_checkpoint`]; the rest of
//! [`StationRegistry`] is the operator's create/read/update/soft-delete surface.

use std::sync::Arc;

use chrono::Utc;
use tracing::info;

use crate::db::checkpoints::{self, normalize_code};
use crate::db::{Checkpoint, CreateCheckpointInput, GateDb, Page};
use crate::error::StorageError;

const MIN_CODE_LEN: usize = 3;
const MAX_CODE_LEN: usize = 10;
const SEARCH_LIMIT: u32 = 20;

/// Read-side view of checkpoints used when deciding a gate event
pub trait StationDirectory: Send + Sync {
    /// Active checkpoint for a code (case-insensitive), if any
    fn lookup_checkpoint(&self, code: &str) -> Result<Option<Checkpoint>, StorageError>;
}

/// SQLite-backed checkpoint registry
pub struct StationRegistry {
    db: Arc<GateDb>,
}

impl StationRegistry {
    pub fn new(db: Arc<GateDb>) -> Self {
        Self { db }
    }

    pub fn create(&self, input: CreateCheckpointInput) -> Result<Checkpoint, StorageError> {
        let code = normalize_code(&input.code);
        if !(MIN_CODE_LEN..=MAX_CODE_LEN).contains(&code.chars().count()) {
            return Err(StorageError::InvalidInput(format!(
                "checkpoint code must be {}-{} characters",
                MIN_CODE_LEN, MAX_CODE_LEN
            )));
        }
        if input.name.trim().is_empty() {
            return Err(StorageError::InvalidInput("checkpoint name is required".into()));
        }

        let input = CreateCheckpointInput {
            code,
            name: input.name.trim().to_string(),
            city: input.city.trim().to_string(),
        };
        let checkpoint = self
            .db
            .with_conn(|conn| checkpoints::create_checkpoint(conn, &input, Utc::now()))?;

        info!(code = %checkpoint.code, name = %checkpoint.name, "Checkpoint created");
        Ok(checkpoint)
    }

    pub fn get(&self, id: &str) -> Result<Option<Checkpoint>, StorageError> {
        self.db.with_conn(|conn| checkpoints::get_checkpoint(conn, id))
    }

    pub fn list(&self, page: Page) -> Result<Vec<Checkpoint>, StorageError> {
        self.db.with_conn(|conn| checkpoints::list_checkpoints(conn, page))
    }

    pub fn search(&self, query: &str) -> Result<Vec<Checkpoint>, StorageError> {
        self.db
            .with_conn(|conn| checkpoints::search_checkpoints(conn, query, SEARCH_LIMIT))
    }

    /// Rename or relocate; the code never changes
    pub fn update(&self, id: &str, name: Option<&str>, city: Option<&str>) -> Result<Checkpoint, StorageError> {
        self.db
            .with_conn(|conn| checkpoints::update_checkpoint(conn, id, name, city, Utc::now()))?
            .ok_or_else(|| StorageError::NotFound(format!("checkpoint {}", id)))
    }

    pub fn soft_delete(&self, id: &str) -> Result<bool, StorageError> {
        let deleted = self
            .db
            .with_conn(|conn| checkpoints::soft_delete_checkpoint(conn, id, Utc::now()))?;
        if deleted {
            info!(id = %id, "Checkpoint deactivated");
        }
        Ok(deleted)
    }
}

impl StationDirectory for StationRegistry {
    fn lookup_checkpoint(&self, code: &str) -> Result<Option<Checkpoint>, StorageError> {
        self.db.with_conn(|conn| checkpoints::get_active_by_code(conn, code))
    }
}
