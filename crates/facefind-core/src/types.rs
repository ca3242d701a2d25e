use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// Cosine similarity of two equal-length vectors.
///
/// Returns 0.0 when either vector has zero norm. Extra trailing elements of the
/// longer slice are ignored; callers that care about dimensionality check it first.
///
/// Sums are accumulated in `f64` so any finite `f32` input stays in range.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { (dot / denom) as f32 } else { 0.0 }
}

/// Where a photo lives: its identifier and a URL the image can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhotoRef {
    pub photo_id: String,
    pub url: String,
}

/// One detected face's embedding, tied to the photo it was extracted from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub photo: PhotoRef,
    pub embedding: Embedding,
}

/// A record as read back from storage, vector still in its persisted encoding.
#[derive(Debug, Clone)]
pub struct EncodedRecord {
    pub photo: PhotoRef,
    pub encoded: Vec<u8>,
}

/// A photo whose stored face scored above the query threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub photo: PhotoRef,
    /// Cosine similarity rounded to three decimals.
    pub score: f32,
}
