//! Error types surfaced to callers of the engine.

use std::fmt;

use thiserror::Error;

use crate::db::ProcessingStatus;

/// Why an encode (or a probe derivation) produced nothing usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingFailure {
    NoFaceDetected,
    BackendUnavailable,
    NoFaceInProbe,
    ImageUnreadable,
    Interrupted,
}

impl ProcessingFailure {
    /// Reason code persisted on failed photos.
    pub fn code(&self) -> &'static str {
        match self {
            ProcessingFailure::NoFaceDetected => "no_face_detected",
            ProcessingFailure::BackendUnavailable => "backend_unavailable",
            ProcessingFailure::NoFaceInProbe => "no_face_in_probe",
            ProcessingFailure::ImageUnreadable => "image_unreadable",
            ProcessingFailure::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for ProcessingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Why a caller may not search or upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenial {
    InvalidCode,
    EventNotPublished,
    NotOrganizer,
}

impl fmt::Display for AccessDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AccessDenial::InvalidCode => "invalid_code",
            AccessDenial::EventNotPublished => "event_not_published",
            AccessDenial::NotOrganizer => "not_organizer",
        })
    }
}

#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input (bad access code, missing probe, wrong file type)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown photo/event or an ownership mismatch
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Processing error: {0}")]
    Processing(ProcessingFailure),

    #[error("Quota exceeded: {used} bytes used + {incoming} incoming > {limit} limit")]
    QuotaExceeded { used: u64, incoming: u64, limit: u64 },

    #[error("Access denied: {0}")]
    AccessDenied(AccessDenial),

    /// A processing state change the state machine does not allow
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: ProcessingStatus,
        to: ProcessingStatus,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(ProcessingFailure::NoFaceDetected.code(), "no_face_detected");
        assert_eq!(ProcessingFailure::BackendUnavailable.code(), "backend_unavailable");
        assert_eq!(
            Error::AccessDenied(AccessDenial::EventNotPublished).to_string(),
            "Access denied: event_not_published"
        );
    }

    #[test]
    fn test_quota_message() {
        let err = Error::QuotaExceeded { used: 90, incoming: 20, limit: 100 };
        assert!(err.to_string().contains("90 bytes used + 20 incoming > 100 limit"));
    }
}
