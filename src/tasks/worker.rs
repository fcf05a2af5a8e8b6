//! Encode workers: claim a queued photo, run the pipeline, commit or fail.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::EncodeQueue;
use crate::db::{Database, NewFace, Photo};
use crate::error::{Error, ProcessingFailure, Result};
use crate::faces::EncodingPipeline;
use crate::index::{CommitOutcome, FaceIndex, IndexedFace, IndexedPhoto};
use crate::storage::BlobStore;

/// Everything a worker touches.
#[derive(Clone)]
pub struct WorkerShared {
    pub db: Arc<Database>,
    pub index: Arc<FaceIndex>,
    pub blobs: Arc<dyn BlobStore>,
    pub pipeline: Arc<EncodingPipeline>,
    pub queue: EncodeQueue,
}

impl WorkerShared {
    /// Drive one photo from `queued` to `completed` or `failed`.
    pub async fn process(&self, photo_id: i64) -> Result<()> {
        match self.db.claim_photo(photo_id) {
            Ok(()) => {}
            // Already claimed elsewhere, re-queued twice, or deleted
            Err(Error::InvalidTransition { .. }) | Err(Error::NotFound(_)) => {
                tracing::debug!(photo_id, "Photo no longer queued, skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let Some(photo) = self.db.get_photo(photo_id)? else {
            return Ok(());
        };
        tracing::debug!(photo_id, event_id = photo.event_id, file = %photo.filename, "Encoding photo");

        let blobs = Arc::clone(&self.blobs);
        let key = photo.storage_ref.clone();
        let bytes = tokio::task::spawn_blocking(move || blobs.get(&key))
            .await
            .map_err(|e| anyhow::anyhow!("Blob read task failed: {}", e))?;

        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(photo_id, error = %e, "Stored image missing");
                return self.fail(photo_id, ProcessingFailure::ImageUnreadable);
            }
        };

        match self.pipeline.encode(bytes).await {
            Ok(faces) => self.commit(&photo, faces),
            Err(reason) => self.fail(photo_id, reason),
        }
    }

    fn commit(&self, photo: &Photo, faces: Vec<NewFace>) -> Result<()> {
        let indexed = IndexedPhoto {
            photo_id: photo.id,
            event_id: photo.event_id,
            created_at: photo.created_at,
            faces: faces
                .iter()
                .enumerate()
                .map(|(i, face)| IndexedFace {
                    face_index: i as u32,
                    embedding: face.embedding.clone(),
                })
                .collect(),
        };

        let outcome = self.index.commit(indexed, || match self.db.complete_photo(photo.id, &faces) {
            Ok(()) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        })?;

        match outcome {
            CommitOutcome::Published => {
                tracing::info!(photo_id = photo.id, faces = faces.len(), "Photo completed");
            }
            CommitOutcome::Discarded => {
                tracing::info!(photo_id = photo.id, "Photo deleted or re-queued during encode, result discarded");
            }
        }
        Ok(())
    }

    fn fail(&self, photo_id: i64, reason: ProcessingFailure) -> Result<()> {
        match self.db.fail_photo(photo_id, reason.code()) {
            Ok(()) => {
                tracing::info!(photo_id, reason = %reason, "Photo failed");
                Ok(())
            }
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Startup recovery: photos a dead process left mid-encode become
    /// `failed: interrupted`; everything queued is enqueued again.
    pub fn recover(&self) -> Result<usize> {
        let interrupted = self
            .db
            .fail_interrupted_photos(ProcessingFailure::Interrupted.code())?;
        if interrupted > 0 {
            tracing::warn!(count = interrupted, "Marked interrupted photos as failed");
        }
        self.queue.sweep(&self.db)
    }
}

/// A fixed number of tokio tasks draining the encode queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    /// Start `count` workers that run until `shutdown`.
    pub fn start(shared: WorkerShared, count: usize) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let handles = (0..count.max(1))
            .map(|worker| {
                let shared = shared.clone();
                let mut signal = signal.clone();
                tokio::spawn(async move {
                    loop {
                        let photo_id = tokio::select! {
                            _ = signal.changed() => break,
                            next = shared.queue.next() => match next {
                                Some(id) => id,
                                None => break,
                            },
                        };
                        if let Err(e) = shared.process(photo_id).await {
                            tracing::error!(worker, photo_id, error = %e, "Encode failed");
                        }
                    }
                    tracing::debug!(worker, "Encode worker stopped");
                })
            })
            .collect();

        tracing::info!(workers = count.max(1), "Encode workers started");
        Self { handles, shutdown }
    }

    /// Process whatever is queued right now with `count` workers, then return.
    pub async fn drain(shared: WorkerShared, count: usize) -> usize {
        let handles: Vec<JoinHandle<usize>> = (0..count.max(1))
            .map(|worker| {
                let shared = shared.clone();
                tokio::spawn(async move {
                    let mut done = 0;
                    while let Some(photo_id) = shared.queue.try_next().await {
                        if let Err(e) = shared.process(photo_id).await {
                            tracing::error!(worker, photo_id, error = %e, "Encode failed");
                        }
                        done += 1;
                    }
                    done
                })
            })
            .collect();

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap_or(0);
        }
        total
    }

    /// Stop taking new photos and wait for in-flight encodes to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Encode worker panicked");
            }
        }
    }
}
