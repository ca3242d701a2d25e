//! The face model seen as one capability: image in, (region, embedding) pairs out.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_EMBEDDING_DIM};
use crate::types::{BoundingBox, Embedding};
use image::RgbImage;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// SCRFD detector file from the InsightFace buffalo_l pack.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";
/// ArcFace recognizer file from the InsightFace buffalo_l pack.
pub const RECOGNIZER_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Other(String),
}

/// One detected face and its identity embedding.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub region: BoundingBox,
    pub embedding: Embedding,
}

/// Face detection + recognition backend.
///
/// Implementations return faces in their own detection order and must produce
/// embeddings of exactly [`embedding_dim`](Self::embedding_dim) values.
pub trait FaceAnalyzer {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError>;

    fn embedding_dim(&self) -> usize;
}

/// SCRFD + ArcFace running on ONNX Runtime.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    /// Load both models from `model_dir`. Fails fast if either file is missing.
    pub fn load(model_dir: &Path) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(&model_dir.join(DETECTOR_MODEL_FILE))?;
        let recognizer = FaceRecognizer::load(&model_dir.join(RECOGNIZER_MODEL_FILE))?;
        tracing::info!(model_dir = %model_dir.display(), "face models loaded");
        Ok(Self { detector, recognizer })
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
        let regions = self.detector.detect(image)?;
        let mut faces = Vec::with_capacity(regions.len());
        for region in regions {
            let embedding = self.recognizer.extract(image, &region)?;
            faces.push(DetectedFace { region, embedding });
        }
        Ok(faces)
    }

    fn embedding_dim(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }
}

/// Default model directory: `$XDG_DATA_HOME/facefind/models`, else
/// `~/.local/share/facefind/models`.
pub fn default_model_dir() -> PathBuf {
    default_data_dir().join("models")
}

/// Default data directory shared by the model files and the database.
pub fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facefind")
}
