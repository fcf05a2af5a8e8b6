//! Accepting uploaded images into an event.

use std::path::Path;

use crate::config::IngestConfig;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::scope;
use crate::storage::{self, BlobStore};
use crate::tasks::EncodeQueue;

/// One file in an upload batch.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }
}

/// Per-file result; a rejected file never affects the rest of the batch.
#[derive(Debug)]
pub struct UploadOutcome {
    pub filename: String,
    /// The new photo id
    pub result: Result<i64>,
}

/// Lowercased extension, if it is one we accept.
pub fn accepted_extension(filename: &str, config: &IngestConfig) -> Option<String> {
    let ext = Path::new(filename).extension()?.to_str()?.to_lowercase();
    config
        .allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
        .then_some(ext)
}

pub(crate) struct Ingestor<'a> {
    pub db: &'a Database,
    pub blobs: &'a dyn BlobStore,
    pub queue: &'a EncodeQueue,
    pub config: &'a IngestConfig,
}

impl Ingestor<'_> {
    /// Store each file and queue it for encoding. Ownership of the event is
    /// the caller's job.
    pub fn ingest(&self, event_id: i64, uploads: Vec<Upload>) -> Vec<UploadOutcome> {
        uploads
            .into_iter()
            .map(|upload| {
                let result = self.ingest_one(event_id, &upload);
                match &result {
                    Ok(photo_id) => {
                        tracing::info!(event_id, photo_id, file = %upload.filename, "Photo queued");
                    }
                    Err(e) => {
                        tracing::info!(event_id, file = %upload.filename, error = %e, "Upload rejected");
                    }
                }
                UploadOutcome {
                    filename: upload.filename,
                    result,
                }
            })
            .collect()
    }

    fn ingest_one(&self, event_id: i64, upload: &Upload) -> Result<i64> {
        let ext = accepted_extension(&upload.filename, self.config).ok_or_else(|| {
            Error::validation(format!(
                "unsupported file type; allowed: {}",
                self.config.allowed_extensions.join(", ")
            ))
        })?;

        let size = upload.bytes.len() as u64;
        if size == 0 {
            return Err(Error::validation("empty file"));
        }
        if size > self.config.max_upload_bytes {
            return Err(Error::validation(format!(
                "file is {} bytes, limit is {}",
                size, self.config.max_upload_bytes
            )));
        }

        scope::reserve_quota(self.db, event_id, size, self.config.event_quota_bytes)?;

        let key = storage::new_key(event_id, &ext);
        let stored = self.blobs.put(&key, &upload.bytes).and_then(|()| {
            self.db
                .insert_photo(event_id, &key, &upload.filename, size)
                .inspect_err(|_| {
                    let _ = self.blobs.delete(&key);
                })
        });

        match stored {
            Ok(photo) => {
                self.queue.enqueue(photo.id);
                Ok(photo.id)
            }
            Err(e) => {
                if let Err(release) = self.db.release_storage(event_id, size) {
                    tracing::error!(event_id, error = %release, "Failed to release reserved storage");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{test_db, ProcessingStatus, Role};
    use crate::storage::MemoryBlobStore;

    fn config(quota: u64) -> IngestConfig {
        IngestConfig {
            event_quota_bytes: quota,
            max_upload_bytes: 50,
            ..IngestConfig::default()
        }
    }

    #[test]
    fn test_extension_allow_list() {
        let config = IngestConfig::default();
        assert_eq!(accepted_extension("IMG_1.JPG", &config).as_deref(), Some("jpg"));
        assert_eq!(accepted_extension("a.webp", &config).as_deref(), Some("webp"));
        assert!(accepted_extension("notes.txt", &config).is_none());
        assert!(accepted_extension("noext", &config).is_none());
    }

    #[tokio::test]
    async fn test_batch_is_per_file() {
        let db = test_db();
        let owner = db.create_user("Org", Role::Organizer).unwrap();
        let event = db.create_event(owner.id, "E", "AB12CD34").unwrap();
        let blobs = MemoryBlobStore::new();
        let queue = EncodeQueue::new();
        let config = config(100);
        let ingestor = Ingestor { db: &db, blobs: &blobs, queue: &queue, config: &config };

        let outcomes = ingestor.ingest(
            event.id,
            vec![
                Upload::new("a.jpg", vec![0; 40]),
                Upload::new("b.txt", vec![0; 10]),
                Upload::new("c.png", vec![0; 60]),
                Upload::new("d.jpg", vec![0; 50]),
                Upload::new("e.jpg", vec![0; 20]),
                Upload::new("f.jpg", vec![0; 10]),
            ],
        );

        let ok: Vec<bool> = outcomes.iter().map(|o| o.result.is_ok()).collect();
        // 40 + 50 = 90 used; 20 more would exceed 100, 10 lands exactly on it
        assert_eq!(ok, vec![true, false, false, true, false, true]);
        assert!(matches!(outcomes[1].result, Err(Error::Validation(_))));
        assert!(matches!(outcomes[2].result, Err(Error::Validation(_))));
        assert!(matches!(outcomes[4].result, Err(Error::QuotaExceeded { used: 90, incoming: 20, limit: 100 })));

        assert_eq!(db.get_event(event.id).unwrap().unwrap().storage_bytes_used, 100);
        assert_eq!(blobs.len(), 3);

        let first = *outcomes[0].result.as_ref().unwrap();
        assert_eq!(db.get_photo(first).unwrap().unwrap().status, ProcessingStatus::Queued);
        assert_eq!(queue.try_next().await, Some(first));
    }
}
