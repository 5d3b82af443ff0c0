//! SQLite-backed case store.
//!
//! `CaseDb` is the only code path that writes the case aggregate, its message
//! links, the history and audit trails, and the ticket sequences. Table
//! groups live in sibling files as `impl CaseDb` blocks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::util::{decode_set, encode_set, normalize_email, parse_date, parse_ts, ts};

pub mod types;
pub use types::*;

mod audit;
mod cases;
mod emails;
mod history;
mod people;
mod sequences;

/// Default wait for a competing writer before reporting a conflict.
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CaseDb {
    conn: Connection,
}

impl CaseDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    ///
    /// Nested calls join the outer transaction, so gateway methods can be
    /// composed inside a larger unit of work.
    pub fn with_transaction<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<DbError>,
    {
        if !self.conn.is_autocommit() {
            return f(self);
        }

        self.conn
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| E::from(DbError::from(e)))?;
        match f(self) {
            Ok(val) => {
                if let Err(e) = self.conn.execute_batch("COMMIT") {
                    let _ = self.conn.execute_batch("ROLLBACK");
                    return Err(E::from(DbError::from(e)));
                }
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    /// Open (or create) the database at `path` and apply the schema.
    pub fn open_at(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path: PathBuf = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(DbError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;

        // WAL lets the SLA sweep read while the pipeline writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        crate::migrations::run_migrations(&conn).map_err(DbError::Migration)?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        Ok(Self { conn })
    }

    /// Open the database configured for this installation.
    pub fn open(config: &crate::types::Config) -> Result<Self, DbError> {
        let path = crate::state::database_path(config).map_err(|_| DbError::HomeDirNotFound)?;
        Self::open_at(path)
    }

    /// Bound how long a write waits on a competing writer.
    ///
    /// The engine sets this from the caller's remaining deadline.
    pub fn set_busy_timeout(&self, timeout: Duration) -> Result<(), DbError> {
        self.conn.busy_timeout(timeout)?;
        Ok(())
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

pub(crate) fn get_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn get_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_ts(&r).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn get_opt_date(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<chrono::NaiveDate>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_date(&r).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) const CASE_COLUMNS: &str = "id, ticket, is_provisional, case_type, bucket, ramo_code,
    insurer_code, procedure_code, confidence, missing_fields, special_flags, broker_id,
    assigned_master_id, origin_address, status, created_at, updated_at, first_response_at,
    closed_at, sla_breached, aplazado_until, cancellation_reason, new_start_date, new_end_date";

pub(crate) fn map_case_row(row: &Row<'_>) -> rusqlite::Result<crate::types::Case> {
    let status_raw: String = row.get(14)?;
    let status = status_raw.parse::<crate::types::CaseStatus>().map_err(|e| {
        conversion_error(
            14,
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    let missing: String = row.get(9)?;
    let flags: String = row.get(10)?;

    Ok(crate::types::Case {
        id: row.get(0)?,
        ticket: row.get(1)?,
        is_provisional: row.get::<_, i64>(2)? != 0,
        case_type: row.get(3)?,
        bucket: row.get(4)?,
        ramo_code: row.get(5)?,
        insurer_code: row.get(6)?,
        procedure_code: row.get(7)?,
        confidence: row.get(8)?,
        missing_fields: decode_set(&missing),
        special_flags: decode_set(&flags),
        broker_id: row.get(11)?,
        assigned_master_id: row.get(12)?,
        origin_address: row.get(13)?,
        status,
        created_at: get_ts(row, 15)?,
        updated_at: get_ts(row, 16)?,
        first_response_at: get_opt_ts(row, 17)?,
        closed_at: get_opt_ts(row, 18)?,
        sla_breached: row.get::<_, i64>(19)? != 0,
        aplazado_until: get_opt_ts(row, 20)?,
        cancellation_reason: row.get(21)?,
        new_start_date: get_opt_date(row, 22)?,
        new_end_date: get_opt_date(row, 23)?,
    })
}

#[cfg(test)]
pub mod test_utils {
    use std::collections::BTreeSet;

    use chrono::{DateTime, Utc};

    use super::CaseDb;
    use crate::types::{CaseDraft, RENEWAL_CASE_TYPE};

    /// Create a temporary database for testing.
    ///
    /// We leak the `TempDir` so the directory persists for the duration of the test.
    /// Test temp dirs are cleaned up by the OS.
    pub fn test_db() -> CaseDb {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("test.db");
        std::mem::forget(dir);
        CaseDb::open_at(path).expect("Failed to open test database")
    }

    /// Like `test_db`, but also returns the file path so tests can open
    /// extra connections to the same database.
    pub fn test_db_path() -> std::path::PathBuf {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = dir.path().join("shared.db");
        std::mem::forget(dir);
        CaseDb::open_at(&path).expect("Failed to initialize shared database");
        path
    }

    /// A fully classified renewal draft for broker `broker_id`.
    pub fn sample_draft(broker_id: &str, created_at: DateTime<Utc>) -> CaseDraft {
        CaseDraft {
            case_type: RENEWAL_CASE_TYPE.to_string(),
            bucket: "ramos_generales".to_string(),
            ramo_code: Some("03".to_string()),
            insurer_code: Some("01".to_string()),
            procedure_code: Some("02".to_string()),
            confidence: 0.9,
            missing_fields: BTreeSet::new(),
            special_flags: BTreeSet::new(),
            broker_id: broker_id.to_string(),
            assigned_master_id: Some("master-1".to_string()),
            origin_address: Some("broker@x.com".to_string()),
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::test_db;
    use super::*;

    #[test]
    fn test_transaction_rolls_back_on_err() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|db| {
            db.conn_ref().execute(
                "INSERT INTO profiles (id, email, role, created_at) VALUES ('p1', 'a@b.com', 'broker', ?1)",
                params![ts(Utc::now())],
            )?;
            Err(DbError::Migration("boom".into()))
        });
        assert!(result.is_err());
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_nested_transaction_joins_outer() {
        let db = test_db();
        let result: Result<(), DbError> = db.with_transaction(|outer| {
            outer.with_transaction(|inner| {
                inner.conn_ref().execute(
                    "INSERT INTO profiles (id, email, role, created_at) VALUES ('p1', 'a@b.com', 'broker', ?1)",
                    params![ts(Utc::now())],
                )?;
                Ok::<(), DbError>(())
            })?;
            Err(DbError::Migration("outer failure".into()))
        });
        assert!(result.is_err());
        let count: i64 = db
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM profiles", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0, "inner write must roll back with the outer transaction");
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let path = test_utils::test_db_path();
        let db = CaseDb::open_at(&path).expect("reopen");
        let version: i64 = db
            .conn_ref()
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, 1);
        let _ = db
            .conn_ref()
            .query_row("SELECT 1 FROM cases LIMIT 1", [], |row| row.get::<_, i64>(0))
            .optional()
            .unwrap();
    }

    #[test]
    fn test_set_columns_are_encoded_as_json() {
        let set: std::collections::BTreeSet<String> =
            ["urgente".to_string()].into_iter().collect();
        assert_eq!(encode_set(&set), "[\"urgente\"]");
    }
}
