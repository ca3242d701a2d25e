//! Ranking stored embeddings against a query face.

use crate::codec;
use crate::types::{cosine_similarity, Embedding, EncodedRecord, MatchResult};
use std::cmp::Ordering;
use std::error::Error as StdError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("query embedding is invalid: {0}")]
    InvalidQuery(&'static str),
    #[error("corpus unavailable: {0}")]
    Corpus(#[source] Box<dyn StdError + Send + Sync>),
}

/// Read access to every stored embedding record.
pub trait CorpusSource {
    type Error: StdError + Send + Sync + 'static;

    /// Full snapshot of the corpus, vectors still encoded.
    fn embedding_records(&self) -> Result<Vec<EncodedRecord>, Self::Error>;
}

impl CorpusSource for [EncodedRecord] {
    type Error = std::convert::Infallible;

    fn embedding_records(&self) -> Result<Vec<EncodedRecord>, Self::Error> {
        Ok(self.to_vec())
    }
}

impl CorpusSource for Vec<EncodedRecord> {
    type Error = std::convert::Infallible;

    fn embedding_records(&self) -> Result<Vec<EncodedRecord>, Self::Error> {
        Ok(self.clone())
    }
}

/// Strategy for finding the stored faces that match a query.
pub trait Matcher {
    /// Records scoring strictly above `threshold`, best first.
    ///
    /// Per-record problems (bad encoding, wrong length) skip that record and
    /// never fail the call.
    fn find_matches<C: CorpusSource + ?Sized>(
        &self,
        corpus: &C,
        query: &Embedding,
        threshold: f32,
    ) -> Result<Vec<MatchResult>, MatchError>;
}

/// Brute-force cosine scan over the whole corpus.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearScanMatcher;

impl Matcher for LinearScanMatcher {
    fn find_matches<C: CorpusSource + ?Sized>(
        &self,
        corpus: &C,
        query: &Embedding,
        threshold: f32,
    ) -> Result<Vec<MatchResult>, MatchError> {
        validate_query(query)?;

        let records = corpus
            .embedding_records()
            .map_err(|e| MatchError::Corpus(Box::new(e)))?;
        let scanned = records.len();
        let mut skipped = 0usize;

        let mut results = Vec::new();
        for record in records {
            let Some(similarity) = score_record(&query.values, &record) else {
                skipped += 1;
                continue;
            };
            if similarity > threshold {
                results.push(MatchResult { photo: record.photo, score: round_score(similarity) });
            }
        }

        // Stable sort: equal scores keep corpus order.
        results.sort_by(|a, b| b.score.total_cmp(&a.score));

        tracing::debug!(scanned, skipped, matched = results.len(), threshold, "corpus scan finished");
        Ok(results)
    }
}

fn validate_query(query: &Embedding) -> Result<(), MatchError> {
    if query.values.is_empty() {
        return Err(MatchError::InvalidQuery("empty vector"));
    }
    if query.values.iter().any(|v| !v.is_finite()) {
        return Err(MatchError::InvalidQuery("non-finite value"));
    }
    Ok(())
}

/// Similarity of one stored record to the query, or `None` if the record is unusable.
fn score_record(query: &[f32], record: &EncodedRecord) -> Option<f32> {
    let stored = match codec::decode_vector(&record.encoded) {
        Ok(v) => v,
        Err(e) => {
            tracing::debug!(photo_id = %record.photo.photo_id, error = %e, "skipping undecodable record");
            return None;
        }
    };

    if stored.len() != query.len() {
        tracing::debug!(
            photo_id = %record.photo.photo_id,
            stored = stored.len(),
            query = query.len(),
            "skipping record with mismatched dimension"
        );
        return None;
    }

    let similarity = cosine_similarity(query, &stored);
    if !similarity.is_finite() {
        tracing::debug!(photo_id = %record.photo.photo_id, "skipping record with non-finite similarity");
        return None;
    }
    Some(similarity)
}

/// Round to three decimal places for presentation. Exact halves go to the
/// even neighbour, so 0.8125 becomes 0.812.
fn round_score(score: f32) -> f32 {
    let scaled = f64::from(score) * 1000.0;
    let floor = scaled.floor();
    let rounded = match (scaled - floor).partial_cmp(&0.5) {
        Some(Ordering::Less) => floor,
        Some(Ordering::Greater) => floor + 1.0,
        _ if floor % 2.0 == 0.0 => floor,
        _ => floor + 1.0,
    };
    (rounded / 1000.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PhotoRef;

    fn photo(id: &str) -> PhotoRef {
        PhotoRef { photo_id: id.into(), url: format!("https://photos.example/{id}.jpg") }
    }

    fn binary(id: &str, values: &[f32]) -> EncodedRecord {
        EncodedRecord { photo: photo(id), encoded: codec::encode_vector(values) }
    }

    fn text(id: &str, raw: &str) -> EncodedRecord {
        EncodedRecord { photo: photo(id), encoded: raw.as_bytes().to_vec() }
    }

    /// Unit 2-vector whose cosine with (1, 0) is `s`.
    fn at_similarity(s: f32) -> [f32; 2] {
        [s, (1.0 - s * s).sqrt()]
    }

    fn query() -> Embedding {
        Embedding::new(vec![1.0, 0.0])
    }

    fn ids(results: &[MatchResult]) -> Vec<&str> {
        results.iter().map(|r| r.photo.photo_id.as_str()).collect()
    }

    #[test]
    fn test_threshold_is_strict_and_sorted() {
        let corpus = vec![
            binary("c", &at_similarity(0.41)),
            binary("d", &at_similarity(0.39)),
            binary("a", &at_similarity(0.82)),
            binary("b", &at_similarity(0.55)),
        ];

        let results = LinearScanMatcher.find_matches(&corpus, &query(), 0.4).unwrap();
        assert_eq!(ids(&results), ["a", "b", "c"]);
        let scores: Vec<f32> = results.iter().map(|r| r.score).collect();
        for (got, want) in scores.iter().zip([0.82, 0.55, 0.41]) {
            assert!((got - want).abs() < 1e-6, "{scores:?}");
        }
    }

    #[test]
    fn test_score_equal_to_threshold_excluded() {
        let corpus = vec![binary("same", &[1.0, 0.0])];
        let results = LinearScanMatcher.find_matches(&corpus, &query(), 1.0).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_corrupt_record_skipped() {
        let corpus = vec![
            text("bad", "abc,def"),
            binary("good", &[0.9, 0.1]),
            EncodedRecord { photo: photo("truncated"), encoded: b"FEMB\x02\0\0\0\0\0".to_vec() },
        ];
        let results = LinearScanMatcher.find_matches(&corpus, &query(), 0.4).unwrap();
        assert_eq!(ids(&results), ["good"]);
    }

    #[test]
    fn test_dimension_mismatch_skipped() {
        let corpus = vec![
            binary("three", &[1.0, 0.0, 0.0]),
            text("one", "1.0"),
            binary("two", &[1.0, 0.0]),
        ];
        let results = LinearScanMatcher.find_matches(&corpus, &query(), 0.4).unwrap();
        assert_eq!(ids(&results), ["two"]);
    }

    #[test]
    fn test_zero_vector_record_never_matches() {
        let corpus = vec![binary("zero", &[0.0, 0.0])];
        let results = LinearScanMatcher.find_matches(&corpus, &query(), -0.5).unwrap();
        // Similarity 0.0 is above -0.5, so it is returned with score 0.
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 0.0);

        let results = LinearScanMatcher.find_matches(&corpus, &query(), 0.0).unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_text_and_binary_encodings_score_identically() {
        let stored = [0.731_25f32, -0.2, 0.125, 0.600_006];
        let q = Embedding::new(vec![0.5, 0.1, 0.3, 0.8]);
        let corpus = vec![
            text("legacy", &codec::encode_legacy_text(&stored)),
            binary("canonical", &stored),
        ];

        let results = LinearScanMatcher.find_matches(&corpus, &q, 0.0).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].score, results[1].score);
        // Tie keeps corpus order.
        assert_eq!(ids(&results), ["legacy", "canonical"]);
    }

    #[test]
    fn test_idempotent() {
        let corpus: Vec<EncodedRecord> = (0..20)
            .map(|i| binary(&format!("p{i}"), &at_similarity(i as f32 / 20.0)))
            .collect();
        let first = LinearScanMatcher.find_matches(&corpus, &query(), 0.3).unwrap();
        let second = LinearScanMatcher.find_matches(&corpus, &query(), 0.3).unwrap();
        assert_eq!(first, second);
        assert!(first.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn test_scores_rounded_to_three_decimals() {
        let corpus = vec![binary("p", &at_similarity(0.876_543))];
        let results = LinearScanMatcher.find_matches(&corpus, &query(), 0.5).unwrap();
        assert!((results[0].score - 0.877).abs() < 1e-6, "{}", results[0].score);
    }

    #[test]
    fn test_round_score_halves_to_even() {
        assert_eq!(round_score(0.8125), 0.812);
        assert_eq!(round_score(0.1875), 0.188);
        assert_eq!(round_score(0.0625), 0.062);
        assert_eq!(round_score(-0.8125), -0.812);
        assert_eq!(round_score(0.8126), 0.813);
        assert_eq!(round_score(1.0), 1.0);
    }

    #[test]
    fn test_large_and_tiny_magnitude_records_still_match() {
        let corpus = vec![binary("huge", &[3e20, 1e20]), binary("tiny", &[3e-25, 1e-25])];
        let q = Embedding::new(vec![3.0, 1.0]);
        let results = LinearScanMatcher.find_matches(&corpus, &q, 0.9).unwrap();
        assert_eq!(ids(&results), ["huge", "tiny"]);
        assert!(results.iter().all(|m| m.score == 1.0));
    }

    #[test]
    fn test_multiple_faces_same_photo() {
        let corpus = vec![binary("group", &[0.9, 0.1]), binary("group", &[0.8, 0.3])];
        let results = LinearScanMatcher.find_matches(&corpus, &query(), 0.4).unwrap();
        assert_eq!(ids(&results), ["group", "group"]);
    }

    #[test]
    fn test_empty_query_rejected() {
        let corpus = vec![binary("a", &[1.0])];
        let err = LinearScanMatcher.find_matches(&corpus, &Embedding::new(vec![]), 0.4).unwrap_err();
        assert!(matches!(err, MatchError::InvalidQuery(_)));
    }

    #[test]
    fn test_non_finite_query_rejected() {
        let corpus: Vec<EncodedRecord> = Vec::new();
        let err = LinearScanMatcher
            .find_matches(&corpus, &Embedding::new(vec![f32::NAN, 1.0]), 0.4)
            .unwrap_err();
        assert!(matches!(err, MatchError::InvalidQuery(_)));
    }

    #[test]
    fn test_empty_corpus() {
        let corpus: &[EncodedRecord] = &[];
        assert!(LinearScanMatcher.find_matches(corpus, &query(), 0.4).unwrap().is_empty());
    }

    #[test]
    fn test_corpus_failure_propagates() {
        struct Offline;
        impl CorpusSource for Offline {
            type Error = std::io::Error;
            fn embedding_records(&self) -> Result<Vec<EncodedRecord>, Self::Error> {
                Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "database offline"))
            }
        }
        let err = LinearScanMatcher.find_matches(&Offline, &query(), 0.4).unwrap_err();
        assert!(matches!(err, MatchError::Corpus(_)));
        assert!(err.to_string().contains("database offline"));
    }
}
