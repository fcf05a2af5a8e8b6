//! Transport-agnostic operations: everything a CLI or server calls.

use anyhow::Context;
use serde::Serialize;
use std::sync::Arc;

use crate::config::Config;
use crate::context::RequestContext;
use crate::db::{Database, Event, EventState, Role, User};
use crate::error::{AccessDenial, Error, ProcessingFailure, Result};
use crate::faces::{build_backends, EncodingPipeline, FaceDetector};
use crate::index::FaceIndex;
use crate::ingest::{Ingestor, Upload, UploadOutcome};
use crate::matching::{dominant_face, MatchingEngine, PhotoMatch};
use crate::scope;
use crate::status::{self, EventStatus};
use crate::storage::{BlobStore, FsBlobStore};
use crate::tasks::{EncodeQueue, WorkerPool, WorkerShared};

/// What to search with.
#[derive(Debug, Clone)]
pub enum Probe {
    /// A photo of the person; its dominant face is used
    Image(Vec<u8>),
    /// The caller's stored face
    RegisteredFace,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub probe: Probe,
    pub event_id: Option<i64>,
    pub access_code: Option<String>,
    /// Overrides the configured tolerance, up to its ceiling
    pub tolerance: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub id: i64,
    pub name: String,
    pub status: String,
    /// Only shown to the owner
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_code: Option<String>,
    pub photo_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StorageUsage {
    pub event_id: i64,
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub percent: f64,
}

pub struct Engine {
    config: Config,
    db: Arc<Database>,
    index: Arc<FaceIndex>,
    blobs: Arc<dyn BlobStore>,
    pipeline: Arc<EncodingPipeline>,
    matcher: MatchingEngine,
    queue: EncodeQueue,
}

impl Engine {
    /// Open the configured SQLite database, blob directory and ONNX backends.
    pub fn open(config: Config) -> anyhow::Result<Self> {
        let db = Database::open(&config.database.sqlite_path).with_context(|| {
            format!("Failed to open database {}", config.database.sqlite_path.display())
        })?;
        db.initialize().context("Failed to initialize schema")?;

        let blobs = FsBlobStore::new(&config.storage.root).with_context(|| {
            format!("Failed to open storage root {}", config.storage.root.display())
        })?;
        let backends = build_backends(&config.encoder)?;

        Ok(Self::new(config, Arc::new(db), Arc::new(blobs), backends)?)
    }

    pub fn new(
        config: Config,
        db: Arc<Database>,
        blobs: Arc<dyn BlobStore>,
        backends: Vec<Arc<dyn FaceDetector>>,
    ) -> Result<Self> {
        let index = Arc::new(FaceIndex::load(&db)?);
        let pipeline = Arc::new(EncodingPipeline::new(backends, &config.encoder));
        let matcher = MatchingEngine::new(
            Arc::clone(&index),
            &config.matching,
            pipeline.embedding_dim(),
        );

        tracing::debug!(backends = ?pipeline.backend_names(), "Engine ready");
        Ok(Self {
            config,
            db,
            index,
            blobs,
            pipeline,
            matcher,
            queue: EncodeQueue::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn index(&self) -> &FaceIndex {
        &self.index
    }

    pub fn worker_shared(&self) -> WorkerShared {
        WorkerShared {
            db: Arc::clone(&self.db),
            index: Arc::clone(&self.index),
            blobs: Arc::clone(&self.blobs),
            pipeline: Arc::clone(&self.pipeline),
            queue: self.queue.clone(),
        }
    }

    /// Recover interrupted work and start the configured number of workers.
    pub fn start_workers(&self) -> Result<WorkerPool> {
        let shared = self.worker_shared();
        shared.recover()?;
        Ok(WorkerPool::start(shared, self.config.workers.count))
    }

    pub fn create_user(&self, name: &str, role: Role) -> Result<User> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("name must not be empty"));
        }
        self.db.create_user(name, role)
    }

    /// New events start as drafts with a fresh access code.
    pub fn create_event(&self, ctx: &RequestContext, name: &str) -> Result<Event> {
        let identity = ctx
            .organizer()
            .ok_or(Error::AccessDenied(AccessDenial::NotOrganizer))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("event name must not be empty"));
        }

        let code = scope::issue_unique_code(&self.db)?;
        let event = self.db.create_event(identity.user_id, name, &code)?;
        tracing::info!(event_id = event.id, owner = identity.user_id, "Event created");
        Ok(event)
    }

    pub fn set_event_status(
        &self,
        ctx: &RequestContext,
        event_id: i64,
        state: EventState,
    ) -> Result<Event> {
        scope::require_owned_event(&self.db, ctx, event_id)?;
        self.db.set_event_state(event_id, state)?;
        tracing::info!(event_id, status = %state, "Event status changed");
        self.db
            .get_event(event_id)?
            .ok_or_else(|| Error::not_found(format!("event {}", event_id)))
    }

    /// Replace the event's access code; the old one stops working at once.
    pub fn issue_access_code(&self, ctx: &RequestContext, event_id: i64) -> Result<String> {
        scope::require_owned_event(&self.db, ctx, event_id)?;
        let code = scope::issue_unique_code(&self.db)?;
        self.db.set_access_code(event_id, &code)?;
        tracing::info!(event_id, "Access code issued");
        Ok(code)
    }

    /// Public summary of the published event behind a code.
    pub fn lookup_event_by_code(&self, code: &str) -> Result<EventSummary> {
        let event = scope::event_for_code(&self.db, code)?;
        self.summarize(event, false)
    }

    pub fn event_summary(&self, ctx: &RequestContext, event_id: i64) -> Result<EventSummary> {
        let event = scope::require_owned_event(&self.db, ctx, event_id)?;
        self.summarize(event, true)
    }

    fn summarize(&self, event: Event, owner: bool) -> Result<EventSummary> {
        let photo_count = self.db.count_photos_by_status(event.id)?.total();
        Ok(EventSummary {
            id: event.id,
            name: event.name,
            status: event.state.to_string(),
            access_code: owner.then_some(event.access_code),
            photo_count,
        })
    }

    /// Store uploads as queued photos and hand them to the workers.
    ///
    /// Fails as a whole only when the caller does not own the event.
    pub fn ingest(
        &self,
        ctx: &RequestContext,
        event_id: i64,
        uploads: Vec<Upload>,
    ) -> Result<Vec<UploadOutcome>> {
        scope::require_owned_event(&self.db, ctx, event_id)?;
        let ingestor = Ingestor {
            db: &self.db,
            blobs: self.blobs.as_ref(),
            queue: &self.queue,
            config: &self.config.ingest,
        };
        Ok(ingestor.ingest(event_id, uploads))
    }

    pub async fn search(
        &self,
        ctx: &RequestContext,
        request: SearchRequest,
    ) -> Result<Vec<PhotoMatch>> {
        let scope = scope::resolve(
            &self.db,
            ctx,
            request.event_id,
            request.access_code.as_deref(),
        )?;

        let probe = match request.probe {
            Probe::Image(bytes) => self.probe_embedding(bytes).await?,
            Probe::RegisteredFace => {
                let user_id = ctx
                    .user_id()
                    .ok_or_else(|| Error::validation("sign in to search with a registered face"))?;
                self.db
                    .get_registered_face(user_id)?
                    .ok_or_else(|| Error::validation("no registered face"))?
            }
        };

        let matches = self.matcher.rank(&probe, &scope.event_ids, request.tolerance)?;
        tracing::info!(events = scope.event_ids.len(), matches = matches.len(), "Search finished");
        Ok(matches)
    }

    async fn probe_embedding(&self, bytes: Vec<u8>) -> Result<Vec<f32>> {
        let faces = match self.pipeline.encode(bytes).await {
            Ok(faces) => faces,
            Err(ProcessingFailure::NoFaceDetected) => {
                return Err(Error::Processing(ProcessingFailure::NoFaceInProbe))
            }
            Err(reason) => return Err(Error::Processing(reason)),
        };
        Ok(dominant_face(faces)?.embedding)
    }

    pub fn status(&self, ctx: &RequestContext, event_id: i64) -> Result<EventStatus> {
        scope::require_owned_event(&self.db, ctx, event_id)?;
        status::event_status(&self.db, event_id)
    }

    /// Re-queue a failed photo, or a completed one for re-encoding.
    pub fn retry(&self, ctx: &RequestContext, photo_id: i64) -> Result<()> {
        let photo = self
            .db
            .get_photo(photo_id)?
            .ok_or_else(|| Error::not_found(format!("photo {}", photo_id)))?;
        scope::require_owned_event(&self.db, ctx, photo.event_id)?;

        self.index
            .withdraw(photo_id, || self.db.requeue_photo(photo_id))?;
        self.queue.enqueue(photo_id);
        tracing::info!(photo_id, from = %photo.status, "Photo re-queued");
        Ok(())
    }

    /// Delete a photo, its faces and its stored bytes.
    ///
    /// Safe while the photo is being encoded; the worker discards its result.
    pub fn delete_photo(&self, ctx: &RequestContext, photo_id: i64) -> Result<()> {
        let photo = self
            .db
            .get_photo(photo_id)?
            .ok_or_else(|| Error::not_found(format!("photo {}", photo_id)))?;
        scope::require_owned_event(&self.db, ctx, photo.event_id)?;
        self.remove_photo(photo_id)
    }

    fn remove_photo(&self, photo_id: i64) -> Result<()> {
        let deleted = self
            .index
            .withdraw(photo_id, || self.db.delete_photo(photo_id))?;
        let Some(photo) = deleted else {
            return Err(Error::not_found(format!("photo {}", photo_id)));
        };

        if let Err(e) = self.blobs.delete(&photo.storage_ref) {
            tracing::warn!(photo_id, key = %photo.storage_ref, error = %e, "Failed to delete stored image");
        }
        tracing::info!(photo_id, event_id = photo.event_id, "Photo deleted");
        Ok(())
    }

    /// Delete an event and every photo in it.
    pub fn delete_event(&self, ctx: &RequestContext, event_id: i64) -> Result<()> {
        scope::require_owned_event(&self.db, ctx, event_id)?;

        let photos = self.db.list_photos_for_event(event_id)?;
        let count = photos.len();
        for photo in photos {
            match self.remove_photo(photo.id) {
                Ok(()) | Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.db.delete_event(event_id)?;
        tracing::info!(event_id, photos = count, "Event deleted");
        Ok(())
    }

    /// Store the caller's face for later searches, replacing any earlier one.
    pub async fn register_face(&self, ctx: &RequestContext, image: Vec<u8>) -> Result<()> {
        let user_id = ctx
            .user_id()
            .ok_or_else(|| Error::validation("sign in to register a face"))?;
        let embedding = self.probe_embedding(image).await?;
        if embedding.len() != self.pipeline.embedding_dim() {
            return Err(Error::validation("registered face has the wrong dimension"));
        }
        self.db.set_registered_face(user_id, &embedding)?;
        tracing::info!(user_id, "Face registered");
        Ok(())
    }

    /// Returns whether a face was registered.
    pub fn remove_registered_face(&self, ctx: &RequestContext) -> Result<bool> {
        let user_id = ctx
            .user_id()
            .ok_or_else(|| Error::validation("sign in to remove a registered face"))?;
        self.db.delete_registered_face(user_id)
    }

    pub fn storage_usage(&self, ctx: &RequestContext, event_id: i64) -> Result<StorageUsage> {
        let event = scope::require_owned_event(&self.db, ctx, event_id)?;
        let limit = self.config.ingest.event_quota_bytes;
        let percent = if limit == 0 {
            100.0
        } else {
            (event.storage_bytes_used as f64 / limit as f64 * 1000.0).round() / 10.0
        };
        Ok(StorageUsage {
            event_id,
            used_bytes: event.storage_bytes_used,
            limit_bytes: limit,
            percent,
        })
    }
}
