//! facefind-core — face embedding extraction and similarity matching.
//!
//! Uses SCRFD for face detection and ArcFace for face recognition, both running
//! via ONNX Runtime for CPU inference. Stored embeddings are ranked against a
//! query face with a cosine-similarity scan.

pub mod alignment;
pub mod analyzer;
pub mod codec;
pub mod detector;
pub mod extractor;
pub mod fetch;
pub mod matcher;
pub mod recognizer;
pub mod types;

pub use analyzer::{default_data_dir, default_model_dir, DetectedFace, FaceAnalyzer, OnnxFaceAnalyzer};
pub use detector::FaceDetector;
pub use extractor::{EmbeddingExtractor, ExtractError, ImageInput};
pub use fetch::{BoundedReader, FetchConfig, ImageFetcher};
pub use matcher::{CorpusSource, LinearScanMatcher, MatchError, Matcher};
pub use recognizer::FaceRecognizer;
pub use types::{cosine_similarity, BoundingBox, Embedding, EmbeddingRecord, EncodedRecord, MatchResult, PhotoRef};
