//! Probe derivation and ranked retrieval over the face index.

use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::{DistanceMetric, MatchingConfig};
use crate::db::NewFace;
use crate::error::{Error, ProcessingFailure, Result};
use crate::faces::embedding::{confidence, distance};
use crate::index::{FaceIndex, IndexedPhoto};

/// One photo in a search result.
#[derive(Debug, Clone, Serialize)]
pub struct PhotoMatch {
    pub photo_id: i64,
    pub event_id: i64,
    pub confidence: f32,
    /// The best-matching face in the photo
    pub face_index: u32,
    pub distance: f32,
}

/// The face a probe image stands for: largest box, then highest detector
/// confidence.
pub fn dominant_face(faces: Vec<NewFace>) -> Result<NewFace> {
    faces
        .into_iter()
        .max_by(|a, b| {
            a.bbox
                .area()
                .cmp(&b.bbox.area())
                .then_with(|| a.confidence.partial_cmp(&b.confidence).unwrap_or(Ordering::Equal))
        })
        .ok_or(Error::Processing(ProcessingFailure::NoFaceInProbe))
}

pub struct MatchingEngine {
    index: Arc<FaceIndex>,
    metric: DistanceMetric,
    tolerance: f32,
    max_tolerance: f32,
    max_results: usize,
    embedding_dim: usize,
}

/// Best qualifying face of one photo, carried through sorting.
struct Candidate {
    photo_id: i64,
    event_id: i64,
    created_at: DateTime<Utc>,
    face_index: u32,
    distance: f32,
}

impl MatchingEngine {
    pub fn new(index: Arc<FaceIndex>, config: &MatchingConfig, embedding_dim: usize) -> Self {
        Self {
            index,
            metric: config.metric,
            tolerance: config.tolerance,
            max_tolerance: config.max_tolerance,
            max_results: config.max_results,
            embedding_dim,
        }
    }

    /// Per-request override, clamped to the configured ceiling.
    pub fn effective_tolerance(&self, requested: Option<f32>) -> f32 {
        match requested {
            Some(t) if t.is_finite() && t >= 0.0 => t.min(self.max_tolerance),
            _ => self.tolerance,
        }
    }

    /// Photos in `scope` with a face within tolerance of `probe`.
    ///
    /// Ascending distance; ties go to the earlier photo, then the lower id.
    pub fn rank(
        &self,
        probe: &[f32],
        scope: &HashSet<i64>,
        tolerance: Option<f32>,
    ) -> Result<Vec<PhotoMatch>> {
        if probe.len() != self.embedding_dim {
            return Err(Error::validation(format!(
                "probe has dimension {}, expected {}",
                probe.len(),
                self.embedding_dim
            )));
        }

        let tolerance = self.effective_tolerance(tolerance);
        let photos = self.index.photos_in_scope(scope);

        let mut candidates: Vec<Candidate> = photos
            .par_iter()
            .filter_map(|photo| self.best_face(photo, probe, tolerance))
            .collect();

        candidates.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.photo_id.cmp(&b.photo_id))
        });
        candidates.truncate(self.max_results);

        tracing::debug!(
            scope = scope.len(),
            searched = photos.len(),
            matched = candidates.len(),
            tolerance,
            "Ranked probe"
        );

        Ok(candidates
            .into_iter()
            .map(|c| PhotoMatch {
                photo_id: c.photo_id,
                event_id: c.event_id,
                confidence: confidence(c.distance),
                face_index: c.face_index,
                distance: c.distance,
            })
            .collect())
    }

    fn best_face(&self, photo: &IndexedPhoto, probe: &[f32], tolerance: f32) -> Option<Candidate> {
        photo
            .faces
            .iter()
            .filter(|face| face.embedding.len() == probe.len())
            .map(|face| (face.face_index, distance(self.metric, probe, &face.embedding)))
            .filter(|(_, d)| *d <= tolerance)
            .min_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
            })
            .map(|(face_index, distance)| Candidate {
                photo_id: photo.photo_id,
                event_id: photo.event_id,
                created_at: photo.created_at,
                face_index,
                distance,
            })
    }
}
