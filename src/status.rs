//! Per-event processing progress, polled by clients.

use serde::Serialize;

use crate::db::{Database, StatusCounts};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventStatus {
    pub event_id: i64,
    pub total: u64,
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// completed + failed
    pub processed: u64,
    /// Rounded to one decimal; 0 for an empty event
    pub percent: f64,
}

impl EventStatus {
    pub fn from_counts(event_id: i64, counts: StatusCounts) -> Self {
        let total = counts.total();
        let processed = counts.completed + counts.failed;
        let percent = if total == 0 {
            0.0
        } else {
            (processed as f64 / total as f64 * 1000.0).round() / 10.0
        };
        Self {
            event_id,
            total,
            queued: counts.queued,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            processed,
            percent,
        }
    }

    /// Nothing left for the workers to do.
    pub fn is_settled(&self) -> bool {
        self.processed == self.total
    }
}

pub fn event_status(db: &Database, event_id: i64) -> Result<EventStatus> {
    Ok(EventStatus::from_counts(event_id, db.count_photos_by_status(event_id)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        let status = EventStatus::from_counts(
            1,
            StatusCounts { queued: 1, processing: 1, completed: 3, failed: 1 },
        );
        assert_eq!(status.total, 6);
        assert_eq!(status.processed, 4);
        assert_eq!(status.percent, 66.7);
        assert!(!status.is_settled());
    }

    #[test]
    fn test_empty_event() {
        let status = EventStatus::from_counts(1, StatusCounts::default());
        assert_eq!(status.percent, 0.0);
        assert!(status.is_settled());
    }
}
