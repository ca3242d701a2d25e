//! Embedding extraction from paths, URLs, and in-memory buffers.

use crate::analyzer::{AnalyzerError, FaceAnalyzer, OnnxFaceAnalyzer};
use crate::fetch::{FetchConfig, FetchError, ImageFetcher};
use crate::types::Embedding;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("cannot read image {path}: {reason}")]
    ImageRead { path: PathBuf, reason: String },
    #[error("fetching {url} failed: {reason}")]
    Fetch { url: String, reason: String },
    #[error("fetching {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("image exceeds the {limit}-byte limit")]
    PayloadTooLarge { limit: u64 },
    #[error("image bytes could not be decoded: {0}")]
    Decode(#[source] image::ImageError),
    #[error("face analysis failed: {0}")]
    Analysis(#[from] AnalyzerError),
}

impl From<FetchError> for ExtractError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Timeout { url, timeout } => ExtractError::Timeout { url, timeout },
            FetchError::PayloadTooLarge { limit } => ExtractError::PayloadTooLarge { limit },
            FetchError::Fetch { url, reason } => ExtractError::Fetch { url, reason },
        }
    }
}

/// Where an image comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    Path(PathBuf),
    Url(String),
    Bytes(Vec<u8>),
}

impl ImageInput {
    /// Treat `http(s)://...` as a URL and anything else as a filesystem path.
    pub fn parse(s: &str) -> Self {
        if crate::fetch::is_http_url(s) {
            ImageInput::Url(s.to_string())
        } else {
            ImageInput::Path(PathBuf::from(s))
        }
    }
}

/// Owns the loaded face model for its lifetime; construct once and pass it around.
pub struct EmbeddingExtractor<A = OnnxFaceAnalyzer> {
    analyzer: A,
    fetcher: ImageFetcher,
}

impl EmbeddingExtractor<OnnxFaceAnalyzer> {
    /// Load the ONNX models from `model_dir`.
    pub fn load(model_dir: &Path, fetch: FetchConfig) -> Result<Self, ExtractError> {
        Ok(Self::new(OnnxFaceAnalyzer::load(model_dir)?, fetch))
    }
}

impl<A: FaceAnalyzer> EmbeddingExtractor<A> {
    pub fn new(analyzer: A, fetch: FetchConfig) -> Self {
        Self { analyzer, fetcher: ImageFetcher::new(fetch) }
    }

    /// Length of every embedding this extractor produces.
    pub fn embedding_dim(&self) -> usize {
        self.analyzer.embedding_dim()
    }

    /// One embedding per detected face, in detection order.
    ///
    /// An image without faces yields an empty vector, not an error.
    pub fn extract_embeddings(&mut self, input: &ImageInput) -> Result<Vec<Embedding>, ExtractError> {
        let image = self.load_image(input)?;
        self.extract_from_image(&image)
    }

    /// Run the face model on an already-decoded image.
    pub fn extract_from_image(&mut self, image: &RgbImage) -> Result<Vec<Embedding>, ExtractError> {
        let faces = self.analyzer.analyze(image)?;
        let expected = self.analyzer.embedding_dim();

        let mut embeddings = Vec::with_capacity(faces.len());
        for face in faces {
            if face.embedding.dim() != expected {
                return Err(AnalyzerError::Other(format!(
                    "face model returned a {}-dim embedding, expected {expected}",
                    face.embedding.dim()
                ))
                .into());
            }
            embeddings.push(face.embedding);
        }

        tracing::debug!(faces = embeddings.len(), width = image.width(), height = image.height(), "extracted embeddings");
        Ok(embeddings)
    }

    /// Read, fetch, or decode the input into an RGB image.
    pub fn load_image(&self, input: &ImageInput) -> Result<RgbImage, ExtractError> {
        match input {
            ImageInput::Path(path) => {
                let bytes = std::fs::read(path).map_err(|e| ExtractError::ImageRead {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                decode_rgb(&bytes).map_err(|e| ExtractError::ImageRead {
                    path: path.clone(),
                    reason: e.to_string(),
                })
            }
            ImageInput::Url(url) => {
                let bytes = self.fetcher.fetch(url)?;
                decode_rgb(&bytes).map_err(ExtractError::Decode)
            }
            ImageInput::Bytes(bytes) => decode_rgb(bytes).map_err(ExtractError::Decode),
        }
    }
}

fn decode_rgb(bytes: &[u8]) -> Result<RgbImage, image::ImageError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}
