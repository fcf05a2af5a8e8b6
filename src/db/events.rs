//! Events, access codes and per-event storage accounting.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::fmt;
use std::str::FromStr;

use super::{now_timestamp, parse_timestamp, Database};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Draft,
    Published,
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Draft => "draft",
            EventState::Published => "published",
        }
    }
}

impl fmt::Display for EventState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Ok(EventState::Draft),
            "published" => Ok(EventState::Published),
            other => Err(Error::validation(format!("unknown event status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
    pub state: EventState,
    pub access_code: String,
    pub storage_bytes_used: u64,
    pub created_at: DateTime<Utc>,
}

const EVENT_COLUMNS: &str =
    "id, owner_id, name, status, access_code, storage_bytes_used, created_at";

fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
    let state: String = row.get(3)?;
    Ok(Event {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        name: row.get(2)?,
        state: state.parse().map_err(|e: Error| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
        })?,
        access_code: row.get(4)?,
        storage_bytes_used: row.get::<_, i64>(5)?.max(0) as u64,
        created_at: parse_timestamp(6, row.get(6)?)?,
    })
}

impl Database {
    pub fn create_event(&self, owner_id: i64, name: &str, access_code: &str) -> Result<Event> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO events (owner_id, name, status, access_code, created_at) VALUES (?, ?, 'draft', ?, ?)",
            params![owner_id, name, access_code, now_timestamp()],
        )?;
        let id = conn.last_insert_rowid();
        let event = conn.query_row(
            &format!("SELECT {} FROM events WHERE id = ?", EVENT_COLUMNS),
            [id],
            row_to_event,
        )?;
        Ok(event)
    }

    pub fn get_event(&self, event_id: i64) -> Result<Option<Event>> {
        let event = self
            .conn()?
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?", EVENT_COLUMNS),
                [event_id],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    /// Look up by an already-canonicalized (uppercase) code.
    pub fn find_event_by_code(&self, access_code: &str) -> Result<Option<Event>> {
        let event = self
            .conn()?
            .query_row(
                &format!("SELECT {} FROM events WHERE access_code = ?", EVENT_COLUMNS),
                [access_code],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    pub fn access_code_exists(&self, access_code: &str) -> Result<bool> {
        let exists: bool = self.conn()?.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE access_code = ?)",
            [access_code],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn set_access_code(&self, event_id: i64, access_code: &str) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE events SET access_code = ? WHERE id = ?",
            params![access_code, event_id],
        )?;
        if updated == 0 {
            return Err(Error::not_found(format!("event {}", event_id)));
        }
        Ok(())
    }

    pub fn set_event_state(&self, event_id: i64, state: EventState) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE events SET status = ? WHERE id = ?",
            params![state.as_str(), event_id],
        )?;
        if updated == 0 {
            return Err(Error::not_found(format!("event {}", event_id)));
        }
        Ok(())
    }

    pub fn list_event_ids_for_owner(&self, owner_id: i64) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM events WHERE owner_id = ? ORDER BY id")?;
        let ids = stmt
            .query_map([owner_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Photos cascade with the event row.
    pub fn delete_event(&self, event_id: i64) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM events WHERE id = ?", [event_id])?;
        Ok(removed > 0)
    }

    /// Check-and-reserve `incoming` bytes against `limit` in one statement.
    ///
    /// Accepts exactly at `used + incoming == limit`.
    pub fn reserve_storage(&self, event_id: i64, incoming: u64, limit: u64) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE events
            SET storage_bytes_used = storage_bytes_used + ?1
            WHERE id = ?2 AND storage_bytes_used + ?1 <= ?3
            "#,
            params![incoming as i64, event_id, limit as i64],
        )?;
        if updated == 1 {
            return Ok(());
        }

        let used: Option<i64> = conn
            .query_row(
                "SELECT storage_bytes_used FROM events WHERE id = ?",
                [event_id],
                |row| row.get(0),
            )
            .optional()?;
        match used {
            Some(used) => Err(Error::QuotaExceeded {
                used: used.max(0) as u64,
                incoming,
                limit,
            }),
            None => Err(Error::not_found(format!("event {}", event_id))),
        }
    }

    pub fn release_storage(&self, event_id: i64, bytes: u64) -> Result<()> {
        self.conn()?.execute(
            "UPDATE events SET storage_bytes_used = MAX(storage_bytes_used - ?, 0) WHERE id = ?",
            params![bytes as i64, event_id],
        )?;
        Ok(())
    }
}
