use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub encoder: EncoderConfig,

    #[serde(default)]
    pub matching: MatchingConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub workers: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub sqlite_path: PathBuf,
}

fn default_db_path() -> PathBuf {
    Config::data_dir().join("facesift.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory for uploaded originals
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

fn default_storage_root() -> PathBuf {
    Config::data_dir().join("uploads")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

/// How the ensemble combines its backends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnsemblePolicy {
    /// Stop at the first backend that finds a face.
    #[default]
    FirstSuccess,
    /// Run every backend and merge overlapping detections.
    Merge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Backends in priority order (higher recall first)
    #[serde(default = "default_backends")]
    pub backends: Vec<String>,

    #[serde(default)]
    pub policy: EnsemblePolicy,

    #[serde(default = "default_max_faces")]
    pub max_faces: usize,

    /// IoU above which two detections are one face
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,

    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,

    /// Embedding dimension for this deployment
    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Images with a shorter side below this are upscaled before detection
    #[serde(default = "default_min_side")]
    pub min_side: u32,

    /// Upscaling stops before the longer side passes this
    #[serde(default = "default_max_side")]
    pub max_side: u32,

    /// Brighten dim images and sharpen slightly before detection
    #[serde(default)]
    pub enhance: bool,

    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
}

fn default_backends() -> Vec<String> {
    vec!["ultraface-640".to_string(), "ultraface-320".to_string()]
}

fn default_max_faces() -> usize {
    30
}

fn default_iou_threshold() -> f32 {
    0.4
}

fn default_backend_timeout_secs() -> u64 {
    60
}

fn default_embedding_dim() -> usize {
    crate::faces::onnx::ARCFACE_DIM
}

fn default_min_side() -> u32 {
    480
}

fn default_max_side() -> u32 {
    4096
}

fn default_models_dir() -> PathBuf {
    Config::data_dir().join("models")
}

impl EncoderConfig {
    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs)
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            policy: EnsemblePolicy::default(),
            max_faces: default_max_faces(),
            iou_threshold: default_iou_threshold(),
            backend_timeout_secs: default_backend_timeout_secs(),
            embedding_dim: default_embedding_dim(),
            min_side: default_min_side(),
            max_side: default_max_side(),
            enhance: false,
            models_dir: default_models_dir(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    #[default]
    Euclidean,
    Cosine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default)]
    pub metric: DistanceMetric,

    /// Maximum distance accepted as a match
    #[serde(default = "default_tolerance")]
    pub tolerance: f32,

    /// Ceiling for per-request tolerance overrides
    #[serde(default = "default_max_tolerance")]
    pub max_tolerance: f32,

    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

fn default_tolerance() -> f32 {
    0.55
}

fn default_max_tolerance() -> f32 {
    0.8
}

fn default_max_results() -> usize {
    200
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::default(),
            tolerance: default_tolerance(),
            max_tolerance: default_max_tolerance(),
            max_results: default_max_results(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Storage quota per event
    #[serde(default = "default_event_quota_bytes")]
    pub event_quota_bytes: u64,

    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,

    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

fn default_event_quota_bytes() -> u64 {
    4 * 1024 * 1024 * 1024 // 4GB, roughly 2000 photos at 2MB
}

fn default_max_upload_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    vec![
        "jpg".to_string(),
        "jpeg".to_string(),
        "png".to_string(),
        "webp".to_string(),
    ]
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            event_quota_bytes: default_event_quota_bytes(),
            max_upload_bytes: default_max_upload_bytes(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,

    /// How often the daemon sweeps the database for queued photos
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().min(4))
        .unwrap_or(2)
}

fn default_poll_interval_secs() -> u64 {
    30
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl Config {
    /// Load from the default location, writing defaults out if missing.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    /// `FACESIFT_CONFIG` overrides the XDG location.
    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("FACESIFT_CONFIG") {
            return PathBuf::from(path);
        }
        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("facesift")
    }

    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join("facesift")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [matching]
            tolerance = 0.5
            metric = "cosine"

            [encoder]
            policy = "merge"
            "#,
        )
        .unwrap();

        assert_eq!(config.matching.tolerance, 0.5);
        assert_eq!(config.matching.metric, DistanceMetric::Cosine);
        assert_eq!(config.matching.max_results, 200);
        assert_eq!(config.encoder.policy, EnsemblePolicy::Merge);
        assert_eq!(config.encoder.max_faces, 30);
        assert_eq!(config.ingest.allowed_extensions.len(), 4);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[workers]\ncount = 7\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.workers.count, 7);
        assert_eq!(config.workers.poll_interval_secs, 30);
    }
}
