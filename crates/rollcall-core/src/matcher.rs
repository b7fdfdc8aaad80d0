use crate::cache::Gallery;
use crate::types::{unit_vector, EMBEDDING_DIM};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default number of ranked candidates returned per query.
pub const DEFAULT_TOP_K: usize = 3;

/// Rounding slack on the threshold comparison. The dot product of two unit
/// vectors of the same direction can land a few ulps below 1.0.
const SIMILARITY_TOLERANCE: f64 = 1e-9;

/// One identity that cleared the threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCandidate {
    pub identity_id: String,
    pub display_name: String,
    /// Cosine similarity in [-1, 1].
    pub similarity: f64,
    /// `1 - similarity`.
    pub distance: f64,
}

/// Result of matching one query embedding against the gallery.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// True iff `candidates` is non-empty.
    pub matched: bool,
    /// Candidates ranked by descending similarity.
    pub candidates: Vec<MatchCandidate>,
}

impl MatchResult {
    pub fn from_candidates(candidates: Vec<MatchCandidate>) -> Self {
        Self {
            matched: !candidates.is_empty(),
            candidates,
        }
    }

    pub fn no_match() -> Self {
        Self::default()
    }

    pub fn best(&self) -> Option<&MatchCandidate> {
        self.candidates.first()
    }
}

/// Strategy for searching a gallery with a query embedding.
pub trait Matcher: Send + Sync {
    fn find(&self, query: &[f32], gallery: &Gallery, threshold: f64, top_k: usize) -> MatchResult;
}

/// Exhaustive cosine-similarity search.
///
/// Linear in gallery size. Each identity appears at most once, at the
/// similarity of its closest reference embedding; ties rank by identity id.
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn find(&self, query: &[f32], gallery: &Gallery, threshold: f64, top_k: usize) -> MatchResult {
        if query.len() != EMBEDDING_DIM {
            tracing::warn!(len = query.len(), expected = EMBEDDING_DIM, "matcher: query has wrong dimension");
            return MatchResult::no_match();
        }
        if top_k == 0 || gallery.is_empty() {
            return MatchResult::no_match();
        }

        let probe = unit_vector(query);

        let mut best_per_identity: HashMap<&str, (f64, &str)> = HashMap::new();
        for reference in gallery.iter() {
            let similarity = probe
                .iter()
                .zip(reference.unit())
                .map(|(a, b)| a * b)
                .sum::<f64>()
                .clamp(-1.0, 1.0);
            if similarity + SIMILARITY_TOLERANCE < threshold {
                continue;
            }
            let entry = best_per_identity
                .entry(reference.identity_id())
                .or_insert((similarity, reference.display_name()));
            if similarity > entry.0 {
                *entry = (similarity, reference.display_name());
            }
        }

        let mut candidates: Vec<MatchCandidate> = best_per_identity
            .into_iter()
            .map(|(id, (similarity, name))| MatchCandidate {
                identity_id: id.to_string(),
                display_name: name.to_string(),
                similarity,
                distance: 1.0 - similarity,
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.identity_id.cmp(&b.identity_id))
        });
        candidates.truncate(top_k);

        MatchResult::from_candidates(candidates)
    }
}
