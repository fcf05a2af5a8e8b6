//! Background encoding: a FIFO queue of photo ids drained by a worker pool.

pub mod worker;

use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::db::Database;
use crate::error::Result;

pub use worker::{WorkerPool, WorkerShared};

/// Photo ids waiting for an encode, oldest first.
///
/// Cloning shares the same queue. An id already waiting is not added again;
/// beyond that, only the first worker to claim a photo does anything with it.
#[derive(Clone)]
pub struct EncodeQueue {
    tx: mpsc::UnboundedSender<i64>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<i64>>>,
    waiting: Arc<DashSet<i64>>,
}

impl EncodeQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
            waiting: Arc::new(DashSet::new()),
        }
    }

    pub fn enqueue(&self, photo_id: i64) {
        if !self.waiting.insert(photo_id) {
            return;
        }
        // The receiver lives as long as any clone of the queue
        if self.tx.send(photo_id).is_err() {
            self.waiting.remove(&photo_id);
            tracing::warn!(photo_id, "Encode queue closed, photo stays queued");
        }
    }

    /// Wait for the next id.
    pub(crate) async fn next(&self) -> Option<i64> {
        let id = self.rx.lock().await.recv().await?;
        self.waiting.remove(&id);
        Some(id)
    }

    /// The next id if one is waiting right now.
    pub(crate) async fn try_next(&self) -> Option<i64> {
        let id = self.rx.lock().await.try_recv().ok()?;
        self.waiting.remove(&id);
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }

    /// Enqueue every photo the database has as queued, oldest first.
    /// Returns how many were found.
    ///
    /// Picks up uploads made by another process and photos re-queued by hand.
    pub fn sweep(&self, db: &Database) -> Result<usize> {
        let ids = db.list_queued_photo_ids()?;
        for &id in &ids {
            self.enqueue(id);
        }
        if !ids.is_empty() {
            tracing::debug!(count = ids.len(), "Swept queued photos");
        }
        Ok(ids.len())
    }
}

impl Default for EncodeQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, Role};

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = EncodeQueue::new();
        queue.enqueue(3);
        queue.enqueue(1);
        queue.enqueue(2);

        assert_eq!(queue.next().await, Some(3));
        assert_eq!(queue.try_next().await, Some(1));
        assert_eq!(queue.clone().try_next().await, Some(2));
        assert_eq!(queue.try_next().await, None);
    }

    #[tokio::test]
    async fn test_waiting_ids_are_not_duplicated() {
        let queue = EncodeQueue::new();
        queue.enqueue(5);
        queue.enqueue(5);
        assert_eq!(queue.len(), 1);

        assert_eq!(queue.try_next().await, Some(5));
        assert_eq!(queue.try_next().await, None);

        // Once taken, the id may be queued again
        queue.enqueue(5);
        assert_eq!(queue.try_next().await, Some(5));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_enqueues_queued_photos() {
        let db = test_db();
        let owner = db.create_user("Org", Role::Organizer).unwrap();
        let event = db.create_event(owner.id, "E", "AB12CD34").unwrap();
        let a = db.insert_photo(event.id, "a", "a.jpg", 1).unwrap();
        let b = db.insert_photo(event.id, "b", "b.jpg", 1).unwrap();
        db.claim_photo(a.id).unwrap();

        let queue = EncodeQueue::new();
        assert_eq!(queue.sweep(&db).unwrap(), 1);
        assert_eq!(queue.try_next().await, Some(b.id));
    }
}
