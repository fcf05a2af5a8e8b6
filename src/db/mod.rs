mod schema;
pub mod events;
pub mod faces;
pub mod photos;
pub mod users;

use anyhow::anyhow;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;

pub use schema::SCHEMA;
pub use events::{Event, EventState};
pub use faces::{bytes_to_embedding, embedding_to_bytes, BoundingBox, NewFace, StoredFace};
pub use photos::{Photo, ProcessingStatus, StatusCounts};
pub use users::{Role, User};

/// Relational store for users, events, photos and their face embeddings.
///
/// Shared between the engine and the encode workers; statements are short
/// and every multi-step change runs in one transaction.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn initialize(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow!("Failed to lock database connection: {}", e).into())
    }
}

pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(idx: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
pub(crate) fn test_db() -> Database {
    let db = Database::open_in_memory().unwrap();
    db.initialize().unwrap();
    db
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_is_idempotent() {
        let db = test_db();
        db.initialize().unwrap();

        let has_reason: bool = db
            .conn()
            .unwrap()
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM pragma_table_info('photos') WHERE name = 'failure_reason')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(has_reason);
    }

    #[test]
    fn test_open_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("nested/facesift.db")).unwrap();
        db.initialize().unwrap();
        assert!(dir.path().join("nested/facesift.db").exists());
    }

    #[test]
    fn test_timestamp_roundtrip_orders() {
        let a = now_timestamp();
        let b = now_timestamp();
        let pa = parse_timestamp(0, a).unwrap();
        let pb = parse_timestamp(0, b).unwrap();
        assert!(pa <= pb);
    }
}
