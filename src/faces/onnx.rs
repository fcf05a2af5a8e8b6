//! ONNX Runtime backends: UltraFace detection + ArcFace embeddings.
//!
//! Models are downloaded into the models directory on first use and the
//! sessions are loaded lazily, once per backend.

use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use super::detector::{nms, DetectedFace, FaceDetector};
use crate::db::BoundingBox;

/// ArcFace output size
pub const ARCFACE_DIM: usize = 512;

const ARCFACE_FILE: &str = "arcface-resnet100.onnx";
const ARCFACE_URL: &str =
    "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/arcface/model/arcfaceresnet100-11-int8.onnx";

/// One UltraFace input resolution.
#[derive(Debug, Clone, Copy)]
pub struct UltraFaceVariant {
    pub name: &'static str,
    file: &'static str,
    url: &'static str,
    width: u32,
    height: u32,
}

impl UltraFaceVariant {
    /// 640x480 input, finds smaller faces
    pub const RFB_640: UltraFaceVariant = UltraFaceVariant {
        name: "ultraface-640",
        file: "ultraface-640.onnx",
        url: "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-640.onnx",
        width: 640,
        height: 480,
    };

    /// 320x240 input, fast
    pub const RFB_320: UltraFaceVariant = UltraFaceVariant {
        name: "ultraface-320",
        file: "ultraface-320.onnx",
        url: "https://github.com/onnx/models/raw/main/validated/vision/body_analysis/ultraface/models/version-RFB-320.onnx",
        width: 320,
        height: 240,
    };
}

/// Download a model file if it doesn't exist
fn ensure_model(models_dir: &Path, filename: &str, url: &str) -> Result<PathBuf> {
    std::fs::create_dir_all(models_dir)?;
    let model_path = models_dir.join(filename);

    if !model_path.exists() {
        tracing::info!(model = %filename, "Downloading model...");
        let response = ureq::get(url)
            .call()
            .map_err(|e| anyhow!("Failed to download model: {}", e))?;

        // Write to a temp name so a broken download is never picked up
        let partial = model_path.with_extension("part");
        let mut file = std::fs::File::create(&partial)?;
        std::io::copy(&mut response.into_reader(), &mut file)?;
        std::fs::rename(&partial, &model_path)?;
        tracing::info!(model = %filename, path = ?model_path, "Model downloaded");
    }

    Ok(model_path)
}

fn load_session(path: &Path) -> Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(path)?;
    Ok(session)
}

/// Lazily-initialized session slot.
fn session_in<'a>(
    slot: &'a OnceLock<Mutex<Session>>,
    models_dir: &Path,
    filename: &str,
    url: &str,
) -> Result<&'a Mutex<Session>> {
    if let Some(session) = slot.get() {
        return Ok(session);
    }
    let path = ensure_model(models_dir, filename, url)?;
    let session = load_session(&path)?;
    let _ = slot.set(Mutex::new(session));
    slot.get()
        .ok_or_else(|| anyhow!("Session for {} not initialized", filename))
}

/// ArcFace encoder shared by every UltraFace variant.
pub struct ArcFaceEncoder {
    models_dir: PathBuf,
    session: OnceLock<Mutex<Session>>,
}

impl ArcFaceEncoder {
    pub fn new(models_dir: PathBuf) -> Self {
        Self {
            models_dir,
            session: OnceLock::new(),
        }
    }

    fn embed(&self, face_img: &DynamicImage) -> Result<Vec<f32>> {
        const INPUT_SIZE: u32 = 112;

        let slot = session_in(&self.session, &self.models_dir, ARCFACE_FILE, ARCFACE_URL)?;
        let mut session = slot
            .lock()
            .map_err(|e| anyhow!("Failed to lock embedding model: {}", e))?;

        let resized = face_img.resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle);
        let rgb = resized.to_rgb8();

        // NCHW, ArcFace normalization: (pixel - 127.5) / 127.5
        let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
        let mut input_data = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let idx = y as usize * INPUT_SIZE as usize + x as usize;
            input_data[idx] = (pixel[0] as f32 - 127.5) / 127.5;
            input_data[plane + idx] = (pixel[1] as f32 - 127.5) / 127.5;
            input_data[2 * plane + idx] = (pixel[2] as f32 - 127.5) / 127.5;
        }

        let input_tensor = Tensor::from_array((
            [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
            input_data.into_boxed_slice(),
        ))?;

        // ArcFace ONNX model uses "data" as input name
        let outputs = session.run(ort::inputs!["data" => input_tensor])?;

        let embedding_output = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding output"))?;
        let (_embedding_shape, embedding_data) = embedding_output.1.try_extract_tensor::<f32>()?;

        Ok(embedding_data.to_vec())
    }
}

/// UltraFace detector paired with the shared ArcFace encoder.
pub struct OnnxBackend {
    variant: UltraFaceVariant,
    models_dir: PathBuf,
    detection: OnceLock<Mutex<Session>>,
    encoder: Arc<ArcFaceEncoder>,
}

impl OnnxBackend {
    pub fn new(variant: UltraFaceVariant, models_dir: PathBuf, encoder: Arc<ArcFaceEncoder>) -> Self {
        Self {
            variant,
            models_dir,
            detection: OnceLock::new(),
            encoder,
        }
    }

    fn run_ultraface(&self, img: &DynamicImage) -> Result<Vec<(BoundingBox, f32)>> {
        const CONFIDENCE_THRESHOLD: f32 = 0.7;
        const NMS_THRESHOLD: f32 = 0.3;

        let slot = session_in(
            &self.detection,
            &self.models_dir,
            self.variant.file,
            self.variant.url,
        )?;
        let mut session = slot
            .lock()
            .map_err(|e| anyhow!("Failed to lock detection model: {}", e))?;

        let (width, height) = (self.variant.width, self.variant.height);
        let (orig_width, orig_height) = img.dimensions();

        let resized = img.resize_exact(width, height, image::imageops::FilterType::Triangle);
        let rgb = resized.to_rgb8();

        // NCHW, normalized to roughly [-1, 1]
        let plane = (width * height) as usize;
        let mut input_data = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let idx = y as usize * width as usize + x as usize;
            input_data[idx] = (pixel[0] as f32 - 127.0) / 128.0;
            input_data[plane + idx] = (pixel[1] as f32 - 127.0) / 128.0;
            input_data[2 * plane + idx] = (pixel[2] as f32 - 127.0) / 128.0;
        }

        let input_tensor = Tensor::from_array((
            [1usize, 3, height as usize, width as usize],
            input_data.into_boxed_slice(),
        ))?;

        let outputs = session.run(ort::inputs!["input" => input_tensor])?;

        let scores_value = outputs.get("scores").ok_or_else(|| anyhow!("No scores output"))?;
        let boxes_value = outputs.get("boxes").ok_or_else(|| anyhow!("No boxes output"))?;

        let (scores_shape, scores_data) = scores_value.try_extract_tensor::<f32>()?;
        let (_boxes_shape, boxes_data) = boxes_value.try_extract_tensor::<f32>()?;

        // scores: [1, anchors, 2] (background, face); boxes: [1, anchors, 4] normalized x1,y1,x2,y2
        let num_anchors = scores_shape[1] as usize;
        let mut face_boxes = Vec::new();

        for i in 0..num_anchors {
            let confidence = scores_data[i * 2 + 1];
            if confidence <= CONFIDENCE_THRESHOLD {
                continue;
            }

            let x1 = (boxes_data[i * 4] * orig_width as f32) as i32;
            let y1 = (boxes_data[i * 4 + 1] * orig_height as f32) as i32;
            let x2 = (boxes_data[i * 4 + 2] * orig_width as f32) as i32;
            let y2 = (boxes_data[i * 4 + 3] * orig_height as f32) as i32;

            let bbox = BoundingBox {
                x: x1.max(0),
                y: y1.max(0),
                width: (x2 - x1).max(1),
                height: (y2 - y1).max(1),
            };
            face_boxes.push((bbox, confidence));
        }

        Ok(nms(face_boxes, NMS_THRESHOLD))
    }
}

impl FaceDetector for OnnxBackend {
    fn name(&self) -> &str {
        self.variant.name
    }

    fn detect(&self, img: &DynamicImage) -> Result<Vec<DetectedFace>> {
        let face_boxes = self.run_ultraface(img)?;
        let (orig_width, orig_height) = img.dimensions();

        let mut detected = Vec::with_capacity(face_boxes.len());
        for (bbox, confidence) in face_boxes {
            let face_crop = crop_face(img, &bbox, orig_width, orig_height);
            match self.encoder.embed(&face_crop) {
                Ok(embedding) => detected.push(DetectedFace {
                    bbox,
                    embedding,
                    confidence,
                }),
                Err(e) => {
                    tracing::warn!(backend = self.variant.name, error = %e, "Face embedding failed, skipping face");
                }
            }
        }

        Ok(detected)
    }
}

/// Crop face region from image with 20% padding
fn crop_face(img: &DynamicImage, bbox: &BoundingBox, img_width: u32, img_height: u32) -> DynamicImage {
    let padding_x = (bbox.width as f32 * 0.2) as i32;
    let padding_y = (bbox.height as f32 * 0.2) as i32;

    let x = ((bbox.x - padding_x).max(0) as u32).min(img_width.saturating_sub(1));
    let y = ((bbox.y - padding_y).max(0) as u32).min(img_height.saturating_sub(1));
    let w = ((bbox.width + padding_x * 2).max(1) as u32).min(img_width - x);
    let h = ((bbox.height + padding_y * 2).max(1) as u32).min(img_height - y);

    img.crop_imm(x, y, w.max(1), h.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crop_face_stays_inside_image() {
        let img = DynamicImage::new_rgb8(100, 80);
        let bbox = BoundingBox { x: 90, y: 70, width: 30, height: 30 };
        let crop = crop_face(&img, &bbox, 100, 80);
        let (w, h) = crop.dimensions();
        assert!(w >= 1 && w <= 100);
        assert!(h >= 1 && h <= 80);
    }

    #[test]
    fn test_backend_names() {
        let encoder = Arc::new(ArcFaceEncoder::new(PathBuf::from("/nonexistent")));
        let backend = OnnxBackend::new(UltraFaceVariant::RFB_640, PathBuf::from("/nonexistent"), encoder);
        assert_eq!(backend.name(), "ultraface-640");
    }
}
