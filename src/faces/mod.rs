pub mod detector;
pub mod embedding;
pub mod onnx;
pub mod pipeline;
pub mod preprocess;

pub use detector::{build_backends, DetectedFace, FaceDetector};
pub use pipeline::EncodingPipeline;
