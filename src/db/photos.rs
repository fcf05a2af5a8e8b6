//! Photo rows and the processing state machine.
//!
//! `queued -> processing -> {completed, failed}`; `completed` and `failed`
//! only leave through a manual re-queue back to `queued`. Every status change
//! is a compare-and-set on the current status, so a change attempted from the
//! wrong state is reported rather than applied.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::fmt;
use std::str::FromStr;

use super::faces::{replace_faces, NewFace};
use super::{now_timestamp, parse_timestamp, Database};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessingStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingStatus::Queued => "queued",
            ProcessingStatus::Processing => "processing",
            ProcessingStatus::Completed => "completed",
            ProcessingStatus::Failed => "failed",
        }
    }

    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Queued)
                | (Failed, Queued)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingStatus::Completed | ProcessingStatus::Failed)
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(ProcessingStatus::Queued),
            "processing" => Ok(ProcessingStatus::Processing),
            "completed" => Ok(ProcessingStatus::Completed),
            "failed" => Ok(ProcessingStatus::Failed),
            other => Err(Error::validation(format!("unknown processing status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Photo {
    pub id: i64,
    pub event_id: i64,
    pub storage_ref: String,
    pub filename: String,
    pub size_bytes: u64,
    pub status: ProcessingStatus,
    pub failure_reason: Option<String>,
    pub face_count: u32,
    pub created_at: DateTime<Utc>,
}

/// Per-event photo counts by processing status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.completed + self.failed
    }
}

const PHOTO_COLUMNS: &str =
    "id, event_id, storage_ref, filename, size_bytes, status, failure_reason, face_count, created_at";

fn row_to_photo(row: &Row) -> rusqlite::Result<Photo> {
    let status: String = row.get(5)?;
    Ok(Photo {
        id: row.get(0)?,
        event_id: row.get(1)?,
        storage_ref: row.get(2)?,
        filename: row.get(3)?,
        size_bytes: row.get::<_, i64>(4)?.max(0) as u64,
        status: status.parse().map_err(|e: Error| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        failure_reason: row.get(6)?,
        face_count: row.get::<_, i64>(7)?.max(0) as u32,
        created_at: parse_timestamp(8, row.get(8)?)?,
    })
}

fn query_photo(conn: &Connection, photo_id: i64) -> Result<Option<Photo>> {
    let photo = conn
        .query_row(
            &format!("SELECT {} FROM photos WHERE id = ?", PHOTO_COLUMNS),
            [photo_id],
            row_to_photo,
        )
        .optional()?;
    Ok(photo)
}

/// Compare-and-set the status; explains a miss as NotFound or InvalidTransition.
fn transition(
    conn: &Connection,
    photo_id: i64,
    from: ProcessingStatus,
    to: ProcessingStatus,
    failure_reason: Option<&str>,
    face_count: u32,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition { from, to });
    }

    let updated = conn.execute(
        r#"
        UPDATE photos
        SET status = ?1, failure_reason = ?2, face_count = ?3, updated_at = ?4
        WHERE id = ?5 AND status = ?6
        "#,
        params![
            to.as_str(),
            failure_reason,
            face_count as i64,
            now_timestamp(),
            photo_id,
            from.as_str()
        ],
    )?;
    if updated == 1 {
        return Ok(());
    }

    match query_photo(conn, photo_id)? {
        Some(photo) => Err(Error::InvalidTransition {
            from: photo.status,
            to,
        }),
        None => Err(Error::not_found(format!("photo {}", photo_id))),
    }
}

impl Database {
    /// New photos always start out queued.
    pub fn insert_photo(
        &self,
        event_id: i64,
        storage_ref: &str,
        filename: &str,
        size_bytes: u64,
    ) -> Result<Photo> {
        let conn = self.conn()?;
        let now = now_timestamp();
        conn.execute(
            r#"
            INSERT INTO photos (event_id, storage_ref, filename, size_bytes, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'queued', ?, ?)
            "#,
            params![event_id, storage_ref, filename, size_bytes as i64, now, now],
        )?;
        let id = conn.last_insert_rowid();
        query_photo(&conn, id)?.ok_or_else(|| Error::not_found(format!("photo {}", id)))
    }

    pub fn get_photo(&self, photo_id: i64) -> Result<Option<Photo>> {
        let conn = self.conn()?;
        query_photo(&conn, photo_id)
    }

    pub fn photo_exists(&self, photo_id: i64) -> Result<bool> {
        let exists: bool = self.conn()?.query_row(
            "SELECT EXISTS(SELECT 1 FROM photos WHERE id = ?)",
            [photo_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    pub fn list_photos_for_event(&self, event_id: i64) -> Result<Vec<Photo>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM photos WHERE event_id = ? ORDER BY id",
            PHOTO_COLUMNS
        ))?;
        let photos = stmt
            .query_map([event_id], row_to_photo)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(photos)
    }

    /// Queued photo ids, oldest first.
    pub fn list_queued_photo_ids(&self) -> Result<Vec<i64>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id FROM photos WHERE status = 'queued' ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Worker pickup: `queued -> processing`.
    pub fn claim_photo(&self, photo_id: i64) -> Result<()> {
        let conn = self.conn()?;
        transition(
            &conn,
            photo_id,
            ProcessingStatus::Queued,
            ProcessingStatus::Processing,
            None,
            0,
        )
    }

    /// `processing -> completed`, writing the full face set in the same transaction.
    pub fn complete_photo(&self, photo_id: i64, faces: &[NewFace]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        transition(
            &tx,
            photo_id,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            None,
            faces.len() as u32,
        )?;
        replace_faces(&tx, photo_id, faces)?;
        tx.commit()?;
        Ok(())
    }

    /// `processing -> failed` with a reason code.
    pub fn fail_photo(&self, photo_id: i64, reason: &str) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        transition(
            &tx,
            photo_id,
            ProcessingStatus::Processing,
            ProcessingStatus::Failed,
            Some(reason),
            0,
        )?;
        tx.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])?;
        tx.commit()?;
        Ok(())
    }

    /// Manual re-queue of a terminal photo; clears its embeddings first.
    pub fn requeue_photo(&self, photo_id: i64) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let photo = query_photo(&tx, photo_id)?
            .ok_or_else(|| Error::not_found(format!("photo {}", photo_id)))?;
        if !photo.status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: photo.status,
                to: ProcessingStatus::Queued,
            });
        }
        tx.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])?;
        transition(
            &tx,
            photo_id,
            photo.status,
            ProcessingStatus::Queued,
            None,
            0,
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Photos a dead process left in `processing` become `failed: interrupted`.
    pub fn fail_interrupted_photos(&self, reason: &str) -> Result<usize> {
        let updated = self.conn()?.execute(
            r#"
            UPDATE photos
            SET status = 'failed', failure_reason = ?, face_count = 0, updated_at = ?
            WHERE status = 'processing'
            "#,
            params![reason, now_timestamp()],
        )?;
        Ok(updated)
    }

    /// Delete a photo with its faces and give its bytes back to the event.
    ///
    /// Returns the deleted row so the caller can drop the stored blob.
    pub fn delete_photo(&self, photo_id: i64) -> Result<Option<Photo>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let Some(photo) = query_photo(&tx, photo_id)? else {
            return Ok(None);
        };
        tx.execute("DELETE FROM faces WHERE photo_id = ?", [photo_id])?;
        tx.execute("DELETE FROM photos WHERE id = ?", [photo_id])?;
        tx.execute(
            "UPDATE events SET storage_bytes_used = MAX(storage_bytes_used - ?, 0) WHERE id = ?",
            params![photo.size_bytes as i64, photo.event_id],
        )?;
        tx.commit()?;
        Ok(Some(photo))
    }

    pub fn count_photos_by_status(&self, event_id: i64) -> Result<StatusCounts> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM photos WHERE event_id = ? GROUP BY status")?;
        let rows = stmt.query_map([event_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = count.max(0) as u64;
            match status.parse::<ProcessingStatus>()? {
                ProcessingStatus::Queued => counts.queued = count,
                ProcessingStatus::Processing => counts.processing = count,
                ProcessingStatus::Completed => counts.completed = count,
                ProcessingStatus::Failed => counts.failed = count,
            }
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, BoundingBox, Role};

    fn setup() -> (Database, i64) {
        let db = test_db();
        let owner = db.create_user("Org", Role::Organizer).unwrap();
        let event = db.create_event(owner.id, "Gala", "GALA2345").unwrap();
        (db, event.id)
    }

    fn face(x: i32) -> NewFace {
        NewFace {
            bbox: BoundingBox { x, y: 0, width: 10, height: 10 },
            embedding: vec![1.0, 0.0],
            backend: "stub".to_string(),
            confidence: 0.9,
        }
    }

    #[test]
    fn test_legal_transitions() {
        use ProcessingStatus::*;
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Queued));
        assert!(Completed.can_transition_to(Queued));

        assert!(!Queued.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Processing.can_transition_to(Queued));
    }

    #[test]
    fn test_lifecycle_completed() {
        let (db, event_id) = setup();
        let photo = db.insert_photo(event_id, "events/1/a.jpg", "a.jpg", 100).unwrap();
        assert_eq!(photo.status, ProcessingStatus::Queued);

        db.claim_photo(photo.id).unwrap();
        db.complete_photo(photo.id, &[face(0), face(20)]).unwrap();

        let photo = db.get_photo(photo.id).unwrap().unwrap();
        assert_eq!(photo.status, ProcessingStatus::Completed);
        assert_eq!(photo.face_count, 2);
        assert_eq!(db.get_faces_for_photo(photo.id).unwrap().len(), 2);
    }

    #[test]
    fn test_out_of_order_transition_rejected() {
        let (db, event_id) = setup();
        let photo = db.insert_photo(event_id, "r", "a.jpg", 1).unwrap();

        // Completing a queued photo skips `processing`
        match db.complete_photo(photo.id, &[face(0)]) {
            Err(Error::InvalidTransition { from, to }) => {
                assert_eq!(from, ProcessingStatus::Queued);
                assert_eq!(to, ProcessingStatus::Completed);
            }
            other => panic!("expected invalid transition, got {:?}", other),
        }
        assert!(db.get_faces_for_photo(photo.id).unwrap().is_empty());

        db.claim_photo(photo.id).unwrap();
        assert!(matches!(db.claim_photo(photo.id), Err(Error::InvalidTransition { .. })));
        assert!(matches!(db.requeue_photo(photo.id), Err(Error::InvalidTransition { .. })));
    }

    #[test]
    fn test_requeue_clears_faces() {
        let (db, event_id) = setup();
        let photo = db.insert_photo(event_id, "r", "a.jpg", 1).unwrap();
        db.claim_photo(photo.id).unwrap();
        db.complete_photo(photo.id, &[face(0)]).unwrap();

        db.requeue_photo(photo.id).unwrap();
        let requeued = db.get_photo(photo.id).unwrap().unwrap();
        assert_eq!(requeued.status, ProcessingStatus::Queued);
        assert_eq!(requeued.face_count, 0);
        assert!(db.get_faces_for_photo(photo.id).unwrap().is_empty());
    }

    #[test]
    fn test_fail_records_reason() {
        let (db, event_id) = setup();
        let photo = db.insert_photo(event_id, "r", "a.jpg", 1).unwrap();
        db.claim_photo(photo.id).unwrap();
        db.fail_photo(photo.id, "no_face_detected").unwrap();

        let failed = db.get_photo(photo.id).unwrap().unwrap();
        assert_eq!(failed.status, ProcessingStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("no_face_detected"));
    }

    #[test]
    fn test_complete_after_delete_is_not_found() {
        let (db, event_id) = setup();
        let photo = db.insert_photo(event_id, "r", "a.jpg", 1).unwrap();
        db.claim_photo(photo.id).unwrap();
        db.delete_photo(photo.id).unwrap();

        assert!(matches!(db.complete_photo(photo.id, &[face(0)]), Err(Error::NotFound(_))));
        assert!(db.get_faces_for_photo(photo.id).unwrap().is_empty());
    }

    #[test]
    fn test_delete_releases_storage() {
        let (db, event_id) = setup();
        db.reserve_storage(event_id, 300, 1000).unwrap();
        let photo = db.insert_photo(event_id, "r", "a.jpg", 300).unwrap();

        let deleted = db.delete_photo(photo.id).unwrap().unwrap();
        assert_eq!(deleted.storage_ref, "r");
        assert_eq!(db.get_event(event_id).unwrap().unwrap().storage_bytes_used, 0);
        assert!(db.delete_photo(photo.id).unwrap().is_none());
    }

    #[test]
    fn test_counts_and_interrupted_recovery() {
        let (db, event_id) = setup();
        let a = db.insert_photo(event_id, "a", "a.jpg", 1).unwrap();
        let b = db.insert_photo(event_id, "b", "b.jpg", 1).unwrap();
        db.insert_photo(event_id, "c", "c.jpg", 1).unwrap();
        db.claim_photo(a.id).unwrap();
        db.claim_photo(b.id).unwrap();
        db.complete_photo(b.id, &[face(0)]).unwrap();

        let counts = db.count_photos_by_status(event_id).unwrap();
        assert_eq!(counts, StatusCounts { queued: 1, processing: 1, completed: 1, failed: 0 });
        assert_eq!(counts.total(), 3);

        assert_eq!(db.fail_interrupted_photos("interrupted").unwrap(), 1);
        let counts = db.count_photos_by_status(event_id).unwrap();
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.processing, 0);
    }

    #[test]
    fn test_queued_ids_fifo() {
        let (db, event_id) = setup();
        let a = db.insert_photo(event_id, "a", "a.jpg", 1).unwrap();
        let b = db.insert_photo(event_id, "b", "b.jpg", 1).unwrap();
        assert_eq!(db.list_queued_photo_ids().unwrap(), vec![a.id, b.id]);
    }
}
