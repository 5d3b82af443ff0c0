//! Shared type definitions for the database layer.

use chrono::{DateTime, Utc};
use rusqlite::ErrorCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl DbError {
    /// True when SQLite gave up waiting on another writer.
    pub fn is_busy(&self) -> bool {
        match self {
            DbError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// A row from the `profiles` table (identity store).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbProfile {
    pub id: String,
    pub email: String,
    pub full_name: Option<String>,
    pub role: String,
    pub active: bool,
}

impl DbProfile {
    pub fn is_active_broker(&self) -> bool {
        self.active && self.role == "broker"
    }
}

/// A row from the `master_routing` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbRouting {
    pub bucket: String,
    pub primary_master_id: String,
    pub backup_master_id: Option<String>,
    pub on_leave: bool,
}

impl DbRouting {
    /// The single agent currently responsible for the bucket.
    pub fn effective_master_id(&self) -> &str {
        match (&self.backup_master_id, self.on_leave) {
            (Some(backup), true) => backup,
            _ => &self.primary_master_id,
        }
    }
}

/// A row from the `inbound_messages` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbInboundMessage {
    pub message_id: String,
    pub from_address: String,
    pub cc_addresses: Vec<String>,
    pub subject: String,
    pub body: String,
    pub state: crate::types::MessageState,
    pub classification_attempts: u32,
    pub last_error: Option<String>,
    pub case_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row from the `case_history_events` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCaseEvent {
    pub id: String,
    pub case_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub actor_role: String,
    pub actor_id: Option<String>,
    pub visible_to_broker: bool,
    pub created_at: DateTime<Utc>,
}

/// A row from the `security_audit_logs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAuditLog {
    pub id: String,
    pub actor_type: String,
    pub actor_id: Option<String>,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub before_state: Option<serde_json::Value>,
    pub after_state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
