//! The detector capability shared by every ensemble backend.

use anyhow::{bail, Result};
use image::DynamicImage;
use std::sync::Arc;

use super::onnx::{ArcFaceEncoder, OnnxBackend, UltraFaceVariant};
use crate::config::EncoderConfig;
use crate::db::BoundingBox;

/// A detected face with bounding box and embedding
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Vec<f32>,
    pub confidence: f32,
}

/// One detector/encoder backend.
///
/// `detect` runs on the blocking pool and may take seconds; an `Err` means
/// the backend could not run, which is different from finding no faces.
pub trait FaceDetector: Send + Sync {
    fn name(&self) -> &str;

    fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>>;
}

/// Build the configured ensemble, in priority order.
pub fn build_backends(config: &EncoderConfig) -> Result<Vec<Arc<dyn FaceDetector>>> {
    let encoder = Arc::new(ArcFaceEncoder::new(config.models_dir.clone()));
    let mut backends: Vec<Arc<dyn FaceDetector>> = Vec::new();

    for name in &config.backends {
        let variant = match name.as_str() {
            "ultraface-640" => UltraFaceVariant::RFB_640,
            "ultraface-320" => UltraFaceVariant::RFB_320,
            other => bail!("Unknown face backend '{}'", other),
        };
        backends.push(Arc::new(OnnxBackend::new(
            variant,
            config.models_dir.clone(),
            Arc::clone(&encoder),
        )));
    }

    Ok(backends)
}

/// Non-maximum suppression to remove overlapping detections
pub fn nms(mut boxes: Vec<(BoundingBox, f32)>, threshold: f32) -> Vec<(BoundingBox, f32)> {
    // Sort by confidence descending
    boxes.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BoundingBox, f32)> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| kept.0.iou(&candidate.0) <= threshold) {
            keep.push(candidate);
        }
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nms_keeps_highest_confidence() {
        let a = BoundingBox { x: 0, y: 0, width: 10, height: 10 };
        let b = BoundingBox { x: 1, y: 1, width: 10, height: 10 };
        let c = BoundingBox { x: 50, y: 50, width: 10, height: 10 };

        let kept = nms(vec![(a, 0.8), (b, 0.9), (c, 0.75)], 0.3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].0, b);
        assert_eq!(kept[1].0, c);
    }

    #[test]
    fn test_build_backends_rejects_unknown() {
        let mut config = EncoderConfig::default();
        assert_eq!(build_backends(&config).unwrap().len(), 2);

        config.backends = vec!["dlib-hog".to_string()];
        assert!(build_backends(&config).is_err());
    }
}
