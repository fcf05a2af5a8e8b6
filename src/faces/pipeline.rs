//! Ensemble encoding: image bytes in, normalized face embeddings out.
//!
//! Backends are tried in configured order. A backend that errors, panics or
//! overruns its timeout is skipped; the photo only fails when every backend
//! failed (`backend_unavailable`) or every backend ran and found nothing
//! (`no_face_detected`).

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use image::DynamicImage;

use super::detector::{DetectedFace, FaceDetector};
use super::embedding::normalize;
use super::preprocess::{self, PreparedImage};
use crate::config::{EncoderConfig, EnsemblePolicy};
use crate::db::{BoundingBox, NewFace};
use crate::error::ProcessingFailure;

pub struct EncodingPipeline {
    backends: Vec<Arc<dyn FaceDetector>>,
    policy: EnsemblePolicy,
    max_faces: usize,
    iou_threshold: f32,
    backend_timeout: Duration,
    embedding_dim: usize,
    min_side: u32,
    max_side: u32,
    enhance: bool,
}

impl EncodingPipeline {
    pub fn new(backends: Vec<Arc<dyn FaceDetector>>, config: &EncoderConfig) -> Self {
        Self {
            backends,
            policy: config.policy,
            max_faces: config.max_faces.max(1),
            iou_threshold: config.iou_threshold,
            backend_timeout: config.backend_timeout(),
            embedding_dim: config.embedding_dim,
            min_side: config.min_side,
            max_side: config.max_side,
            enhance: config.enhance,
        }
    }

    pub fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.iter().map(|b| b.name().to_string()).collect()
    }

    /// Decode, detect and encode every face in one image.
    ///
    /// Returned faces carry unit-length embeddings and boxes in original
    /// image pixels, largest first.
    pub async fn encode(&self, bytes: Vec<u8>) -> Result<Vec<NewFace>, ProcessingFailure> {
        let (min_side, max_side, enhance) = (self.min_side, self.max_side, self.enhance);
        let prepared = tokio::task::spawn_blocking(move || {
            preprocess::decode(&bytes).map(|img| preprocess::prepare(img, min_side, max_side, enhance))
        })
        .await;

        let prepared = match prepared {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Image could not be decoded");
                return Err(ProcessingFailure::ImageUnreadable);
            }
            Err(e) => {
                tracing::error!(error = %e, "Image decode task failed");
                return Err(ProcessingFailure::ImageUnreadable);
            }
        };

        let PreparedImage { image, scale } = prepared;
        let image = Arc::new(image);

        let faces = match self.policy {
            EnsemblePolicy::FirstSuccess => self.first_success(&image, scale).await?,
            EnsemblePolicy::Merge => self.merge(&image, scale).await?,
        };

        Ok(self.cap(faces))
    }

    async fn first_success(
        &self,
        image: &Arc<DynamicImage>,
        scale: f32,
    ) -> Result<Vec<NewFace>, ProcessingFailure> {
        let mut any_ran = false;

        for backend in &self.backends {
            let Some(detected) = self.run_backend(backend, image).await else {
                continue;
            };
            any_ran = true;

            let faces = self.sanitize(backend.name(), detected, scale);
            if !faces.is_empty() {
                tracing::debug!(backend = backend.name(), faces = faces.len(), "Backend found faces");
                return Ok(faces);
            }
        }

        Err(if any_ran {
            ProcessingFailure::NoFaceDetected
        } else {
            ProcessingFailure::BackendUnavailable
        })
    }

    async fn merge(
        &self,
        image: &Arc<DynamicImage>,
        scale: f32,
    ) -> Result<Vec<NewFace>, ProcessingFailure> {
        let runs: Vec<_> = self
            .backends
            .iter()
            .map(|backend| {
                let backend = Arc::clone(backend);
                let image = Arc::clone(image);
                let timeout = self.backend_timeout;
                tokio::spawn(async move {
                    let detected = run_with_timeout(&backend, image, timeout).await;
                    (backend, detected)
                })
            })
            .collect();

        let mut any_ran = false;
        let mut candidates: Vec<NewFace> = Vec::new();
        for run in runs {
            let Ok((backend, detected)) = run.await else {
                continue;
            };
            if let Some(detected) = detected {
                any_ran = true;
                candidates.extend(self.sanitize(backend.name(), detected, scale));
            }
        }

        if !any_ran {
            return Err(ProcessingFailure::BackendUnavailable);
        }

        let merged = merge_detections(candidates, self.iou_threshold);
        if merged.is_empty() {
            return Err(ProcessingFailure::NoFaceDetected);
        }
        Ok(merged)
    }

    async fn run_backend(
        &self,
        backend: &Arc<dyn FaceDetector>,
        image: &Arc<DynamicImage>,
    ) -> Option<Vec<DetectedFace>> {
        run_with_timeout(backend, Arc::clone(image), self.backend_timeout).await
    }

    /// Drop unusable detections, normalize embeddings, map boxes back to the
    /// original image.
    fn sanitize(&self, backend: &str, detected: Vec<DetectedFace>, scale: f32) -> Vec<NewFace> {
        detected
            .into_iter()
            .filter_map(|face| {
                if face.bbox.width <= 0 || face.bbox.height <= 0 {
                    return None;
                }
                if face.embedding.len() != self.embedding_dim {
                    tracing::warn!(
                        backend,
                        expected = self.embedding_dim,
                        actual = face.embedding.len(),
                        "Discarding embedding of wrong dimension"
                    );
                    return None;
                }
                let embedding = normalize(&face.embedding)?;
                Some(NewFace {
                    bbox: unscale(face.bbox, scale),
                    embedding,
                    backend: backend.to_string(),
                    confidence: face.confidence,
                })
            })
            .collect()
    }

    /// Keep at most `max_faces`, largest boxes first, in a stable order.
    fn cap(&self, mut faces: Vec<NewFace>) -> Vec<NewFace> {
        faces.sort_by(by_size_then_confidence);
        if faces.len() > self.max_faces {
            tracing::debug!(found = faces.len(), kept = self.max_faces, "Capping faces per image");
            faces.truncate(self.max_faces);
        }
        faces
    }
}

async fn run_with_timeout(
    backend: &Arc<dyn FaceDetector>,
    image: Arc<DynamicImage>,
    timeout: Duration,
) -> Option<Vec<DetectedFace>> {
    let name = backend.name().to_string();
    let task = {
        let backend = Arc::clone(backend);
        tokio::task::spawn_blocking(move || backend.detect(&image))
    };

    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(Ok(faces))) => Some(faces),
        Ok(Ok(Err(e))) => {
            tracing::warn!(backend = %name, error = %e, "Face backend failed, skipping");
            None
        }
        Ok(Err(e)) => {
            tracing::warn!(backend = %name, error = %e, "Face backend panicked, skipping");
            None
        }
        Err(_) => {
            tracing::warn!(backend = %name, timeout = ?timeout, "Face backend timed out, skipping");
            None
        }
    }
}

/// Collapse detections whose boxes overlap past `iou_threshold` into one
/// face, whichever backend reported them.
///
/// Highest confidence wins; earlier backends win ties.
pub fn merge_detections(mut candidates: Vec<NewFace>, iou_threshold: f32) -> Vec<NewFace> {
    // Stable sort keeps backend priority order among equal confidences
    candidates.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

    let mut kept: Vec<NewFace> = Vec::new();
    for candidate in candidates {
        let duplicate = kept
            .iter()
            .any(|k| k.bbox.iou(&candidate.bbox) > iou_threshold);
        if !duplicate {
            kept.push(candidate);
        }
    }
    kept
}

fn by_size_then_confidence(a: &NewFace, b: &NewFace) -> Ordering {
    b.bbox
        .area()
        .cmp(&a.bbox.area())
        .then_with(|| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal))
        .then_with(|| (a.bbox.x, a.bbox.y).cmp(&(b.bbox.x, b.bbox.y)))
}

fn unscale(bbox: BoundingBox, scale: f32) -> BoundingBox {
    if scale == 1.0 {
        return bbox;
    }
    BoundingBox {
        x: (bbox.x as f32 / scale).round() as i32,
        y: (bbox.y as f32 / scale).round() as i32,
        width: ((bbox.width as f32 / scale).round() as i32).max(1),
        height: ((bbox.height as f32 / scale).round() as i32).max(1),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use std::collections::HashMap;

    fn pipeline(backends: Vec<Arc<StubDetector>>, policy: EnsemblePolicy) -> EncodingPipeline {
        let backends: Vec<Arc<dyn FaceDetector>> =
            backends.into_iter().map(|b| b as Arc<dyn FaceDetector>).collect();
        EncodingPipeline::new(backends, &config(2, policy))
    }

    #[tokio::test]
    async fn test_first_success_stops_at_first_hit() {
        let slow = StubDetector::new("slow", Script::Faces(vec![]));
        let fast = StubDetector::new("fast", Script::Faces(vec![face(0, 10, vec![3.0, 4.0], 0.9)]));
        let unused = StubDetector::new("unused", Script::Faces(vec![face(0, 10, vec![1.0, 0.0], 0.9)]));
        let p = pipeline(vec![slow.clone(), fast.clone(), unused.clone()], EnsemblePolicy::FirstSuccess);

        let faces = p.encode(png_bytes(8, 8)).await.unwrap();
        assert_eq!(faces.len(), 1);
        assert_eq!(faces[0].backend, "fast");
        assert!((faces[0].embedding[0] - 0.6).abs() < 1e-6);
        assert_eq!(unused.calls(), 0);
    }

    #[tokio::test]
    async fn test_failing_backend_is_skipped() {
        let broken = StubDetector::new("broken", Script::Fail);
        let good = StubDetector::new("good", Script::Faces(vec![face(0, 10, vec![1.0, 0.0], 0.9)]));
        let p = pipeline(vec![broken, good], EnsemblePolicy::FirstSuccess);

        let faces = p.encode(png_bytes(8, 8)).await.unwrap();
        assert_eq!(faces[0].backend, "good");
    }

    #[tokio::test]
    async fn test_all_backends_failing_is_backend_unavailable() {
        let a = StubDetector::new("a", Script::Fail);
        let b = StubDetector::new("b", Script::Hang(Duration::from_secs(3)));
        let p = pipeline(vec![a, b], EnsemblePolicy::FirstSuccess);

        assert_eq!(p.encode(png_bytes(8, 8)).await.unwrap_err(), ProcessingFailure::BackendUnavailable);
    }

    #[tokio::test]
    async fn test_no_faces_anywhere_is_no_face_detected() {
        let a = StubDetector::new("a", Script::Faces(vec![]));
        let b = StubDetector::new("b", Script::Fail);
        let p = pipeline(vec![a.clone(), b.clone()], EnsemblePolicy::Merge);
        assert_eq!(p.encode(png_bytes(8, 8)).await.unwrap_err(), ProcessingFailure::NoFaceDetected);

        let p = pipeline(vec![a, b], EnsemblePolicy::FirstSuccess);
        assert_eq!(p.encode(png_bytes(8, 8)).await.unwrap_err(), ProcessingFailure::NoFaceDetected);
    }

    #[tokio::test]
    async fn test_unreadable_image() {
        let a = StubDetector::new("a", Script::Faces(vec![]));
        let p = pipeline(vec![a.clone()], EnsemblePolicy::FirstSuccess);
        assert_eq!(p.encode(b"nope".to_vec()).await.unwrap_err(), ProcessingFailure::ImageUnreadable);
        assert_eq!(a.calls(), 0);
    }

    #[tokio::test]
    async fn test_merge_collapses_overlaps_keeping_higher_confidence() {
        let a = StubDetector::new(
            "a",
            Script::Faces(vec![
                face(0, 20, vec![1.0, 0.0], 0.7),
                face(100, 20, vec![0.0, 1.0], 0.9),
            ]),
        );
        let b = StubDetector::new(
            "b",
            Script::Faces(vec![
                face(1, 20, vec![0.6, 0.8], 0.95),
                face(200, 10, vec![1.0, 1.0], 0.8),
            ]),
        );
        let p = pipeline(vec![a, b], EnsemblePolicy::Merge);

        let faces = p.encode(png_bytes(8, 8)).await.unwrap();
        assert_eq!(faces.len(), 3);
        let overlapping = faces.iter().find(|f| f.bbox.x < 10).unwrap();
        assert_eq!(overlapping.backend, "b");
        assert!((overlapping.embedding[1] - 0.8).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_merge_collapses_overlaps_from_one_backend() {
        let raw = StubDetector::new(
            "raw",
            Script::Faces(vec![
                face(0, 20, vec![1.0, 0.0], 0.8),
                face(1, 20, vec![0.0, 1.0], 0.9),
                face(100, 20, vec![1.0, 1.0], 0.7),
            ]),
        );
        let p = pipeline(vec![raw], EnsemblePolicy::Merge);

        let faces = p.encode(png_bytes(8, 8)).await.unwrap();
        assert_eq!(faces.len(), 2);
        let overlapping = faces.iter().find(|f| f.bbox.x < 10).unwrap();
        assert_eq!(overlapping.bbox.x, 1);
        assert!((overlapping.confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_thin_image_upscale_is_bounded() {
        // 1x100 would need x480 to reach min_side; the long side caps it at 4096
        let mut by_width = HashMap::new();
        by_width.insert(41, vec![face(0, 40, vec![1.0, 0.0], 0.9)]);
        let seen = StubDetector::new("seen", Script::ByWidth(by_width));
        let config = EncoderConfig {
            min_side: 480,
            max_side: 4096,
            ..config(2, EnsemblePolicy::FirstSuccess)
        };
        let p = EncodingPipeline::new(vec![seen as Arc<dyn FaceDetector>], &config);

        let faces = p.encode(png_bytes(1, 100)).await.unwrap();
        assert_eq!(faces.len(), 1);
        assert!(faces[0].bbox.height <= 100);
    }

    #[test]
    fn test_embedding_dim_follows_config() {
        let p = pipeline(vec![], EnsemblePolicy::FirstSuccess);
        assert_eq!(p.embedding_dim(), 2);
    }

    #[tokio::test]
    async fn test_cap_keeps_largest_faces() {
        let many: Vec<DetectedFace> = (0..40)
            .map(|i| face(i * 100, 10 + i, vec![1.0, i as f32], 0.9))
            .collect();
        let a = StubDetector::new("a", Script::Faces(many));
        let p = pipeline(vec![a], EnsemblePolicy::FirstSuccess);

        let faces = p.encode(png_bytes(8, 8)).await.unwrap();
        assert_eq!(faces.len(), 30);
        // Sizes 10..=49; the ten smallest are dropped
        assert!(faces.iter().all(|f| f.bbox.width >= 20));
        assert_eq!(faces[0].bbox.width, 49);
    }

    #[tokio::test]
    async fn test_bad_embeddings_discarded() {
        let a = StubDetector::new(
            "a",
            Script::Faces(vec![
                face(0, 10, vec![0.0, 0.0], 0.9),
                face(50, 10, vec![1.0, 0.0, 0.0], 0.9),
            ]),
        );
        let p = pipeline(vec![a], EnsemblePolicy::FirstSuccess);
        assert_eq!(p.encode(png_bytes(8, 8)).await.unwrap_err(), ProcessingFailure::NoFaceDetected);
    }

    #[tokio::test]
    async fn test_encoding_is_deterministic() {
        let a = StubDetector::new(
            "a",
            Script::Faces(vec![face(0, 10, vec![1.0, 2.0], 0.5), face(50, 30, vec![2.0, 1.0], 0.6)]),
        );
        let p = pipeline(vec![a], EnsemblePolicy::FirstSuccess);

        let first = p.encode(png_bytes(8, 8)).await.unwrap();
        let second = p.encode(png_bytes(8, 8)).await.unwrap();
        assert_eq!(first.len(), second.len());
        for (x, y) in first.iter().zip(second.iter()) {
            assert_eq!(x.bbox, y.bbox);
            assert!(x.embedding.iter().zip(&y.embedding).all(|(a, b)| (a - b).abs() < 1e-6));
        }
    }

    #[test]
    fn test_unscale() {
        let b = unscale(BoundingBox { x: 40, y: 20, width: 8, height: 4 }, 4.0);
        assert_eq!(b, BoundingBox { x: 10, y: 5, width: 2, height: 1 });
    }
}
