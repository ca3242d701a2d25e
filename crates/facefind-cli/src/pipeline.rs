use facefind_core::{
    EmbeddingExtractor, ExtractError, FaceAnalyzer, ImageInput, LinearScanMatcher, MatchError, MatchResult, Matcher,
    OnnxFaceAnalyzer,
};
use facefind_store::{FaceStore, PhotoRecord, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Match(#[from] MatchError),
}

/// Result of searching the pool with a selfie.
#[derive(Debug)]
pub enum FindOutcome {
    /// The selfie had no detectable face.
    NoFace,
    /// Matching photos, best first. May be empty.
    Matches(Vec<MatchResult>),
}

/// Upload and search pipeline: one extractor, one store, one matcher.
pub struct PhotoIndex<A = OnnxFaceAnalyzer, M = LinearScanMatcher> {
    extractor: EmbeddingExtractor<A>,
    store: FaceStore,
    matcher: M,
}

impl<A: FaceAnalyzer> PhotoIndex<A, LinearScanMatcher> {
    pub fn new(extractor: EmbeddingExtractor<A>, store: FaceStore) -> Self {
        Self { extractor, store, matcher: LinearScanMatcher }
    }
}

impl<A: FaceAnalyzer, M: Matcher> PhotoIndex<A, M> {
    pub fn store(&self) -> &FaceStore {
        &self.store
    }

    /// Extract every face in a photographer's photo and store one record per face.
    ///
    /// A photo without faces is still stored so it shows up when browsing.
    pub fn upload_photo(
        &mut self,
        input: &ImageInput,
        image_url: &str,
        photographer: &str,
    ) -> Result<PhotoRecord, PipelineError> {
        let embeddings = self.extractor.extract_embeddings(input)?;
        if embeddings.is_empty() {
            tracing::warn!(image_url, photographer, "no face detected in uploaded photo");
        }
        Ok(self.store.index_photo(image_url, photographer, &embeddings)?)
    }

    /// Search the pool for photos containing the selfie's face.
    ///
    /// The first detected face is the query.
    pub fn find_me(&mut self, selfie: &ImageInput, threshold: f32) -> Result<FindOutcome, PipelineError> {
        let embeddings = self.extractor.extract_embeddings(selfie)?;
        let Some(query) = embeddings.first() else {
            tracing::info!("no face detected in selfie");
            return Ok(FindOutcome::NoFace);
        };
        if embeddings.len() > 1 {
            tracing::debug!(faces = embeddings.len(), "selfie has several faces, using the first");
        }

        let matches = self.matcher.find_matches(&self.store, query, threshold)?;
        tracing::info!(matches = matches.len(), threshold, dim = query.dim(), "selfie search finished");
        Ok(FindOutcome::Matches(matches))
    }
}
