//! In-memory embedding cache, populated from a persistence collaborator.
//!
//! The cache is written only by [`EmbeddingCache::load`], [`EmbeddingCache::load_all`]
//! and [`EmbeddingCache::clear`]. Matching holds the read lock for the whole
//! scan, so a load can never interleave with an in-flight match.

use crate::matcher::{MatchResult, Matcher};
use crate::types::{Embedding, EmbeddingRecord, EMBEDDING_DIM};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use thiserror::Error;

/// Default bound on the total number of cached embeddings.
pub const DEFAULT_MAX_CACHED_EMBEDDINGS: usize = 10_000;

/// Rough per-embedding bookkeeping overhead beyond the vectors and strings.
const ENTRY_OVERHEAD_BYTES: usize = 64;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("persistence collaborator unavailable: {0}")]
    Unavailable(String),
    #[error("persistence backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Durable source of enrolled embeddings.
pub trait EmbeddingSource: Send + Sync {
    /// Fetch every stored embedding for the given identities. Identities with
    /// no embeddings may be absent from the map.
    fn fetch_embeddings(
        &self,
        identity_ids: &[String],
    ) -> Result<HashMap<String, Vec<EmbeddingRecord>>, SourceError>;

    /// Every identity known to the source.
    fn identity_ids(&self) -> Result<Vec<String>, SourceError>;
}

impl<T: EmbeddingSource + ?Sized> EmbeddingSource for Arc<T> {
    fn fetch_embeddings(
        &self,
        identity_ids: &[String],
    ) -> Result<HashMap<String, Vec<EmbeddingRecord>>, SourceError> {
        (**self).fetch_embeddings(identity_ids)
    }

    fn identity_ids(&self) -> Result<Vec<String>, SourceError> {
        (**self).identity_ids()
    }
}

/// The cached embeddings, grouped by identity.
#[derive(Debug, Default)]
pub struct Gallery {
    entries: HashMap<String, Vec<Embedding>>,
    embedding_count: usize,
}

impl Gallery {
    pub fn identity_count(&self) -> usize {
        self.entries.len()
    }

    pub fn embedding_count(&self) -> usize {
        self.embedding_count
    }

    pub fn is_empty(&self) -> bool {
        self.embedding_count == 0
    }

    /// Every cached embedding, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Embedding> {
        self.entries.values().flatten()
    }

    pub fn embeddings_for(&self, identity_id: &str) -> &[Embedding] {
        self.entries.get(identity_id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn approx_size_bytes(&self) -> usize {
        self.iter()
            .map(|e| {
                EMBEDDING_DIM * std::mem::size_of::<f64>()
                    + e.identity_id().len()
                    + e.display_name().len()
                    + ENTRY_OVERHEAD_BYTES
            })
            .sum()
    }

    fn replace(&mut self, identity_id: String, embeddings: Vec<Embedding>) {
        let added = embeddings.len();
        let old = if embeddings.is_empty() {
            self.entries.remove(&identity_id)
        } else {
            self.entries.insert(identity_id, embeddings)
        };
        if let Some(old) = old {
            self.embedding_count -= old.len();
        }
        self.embedding_count += added;
    }

    fn count_excluding(&self, identity_id: &str) -> usize {
        self.embedding_count - self.embeddings_for(identity_id).len()
    }
}

/// Read-only cache introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub identity_count: usize,
    pub embedding_count: usize,
    pub approx_size_bytes: usize,
}

/// Outcome of a load call. Loading is best-effort: failures are reported
/// here and logged, never raised, and never disturb entries already cached.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct LoadReport {
    pub requested: usize,
    pub loaded_identities: usize,
    pub loaded_embeddings: usize,
    pub rejected_embeddings: usize,
    pub failed_identities: Vec<String>,
    /// Set when embeddings were dropped to stay within the capacity bound.
    pub truncated: bool,
}

/// Identity -> reference embeddings, bounded by a total embedding count.
pub struct EmbeddingCache {
    source: Box<dyn EmbeddingSource>,
    max_embeddings: usize,
    gallery: RwLock<Gallery>,
}

impl EmbeddingCache {
    pub fn new(source: Box<dyn EmbeddingSource>, max_embeddings: usize) -> Self {
        Self {
            source,
            max_embeddings,
            gallery: RwLock::new(Gallery::default()),
        }
    }

    /// Load the given identities, replacing any cached entries for them.
    ///
    /// Each identity is fetched on its own so one failure never blocks the
    /// rest. Malformed vectors are rejected here, never reaching the matcher.
    pub fn load(&self, identity_ids: &HashSet<String>) -> LoadReport {
        let mut ids: Vec<String> = identity_ids.iter().cloned().collect();
        ids.sort();
        self.load_ids(ids)
    }

    /// Load every identity the source knows about.
    pub fn load_all(&self) -> LoadReport {
        match self.source.identity_ids() {
            Ok(mut ids) => {
                ids.sort();
                ids.dedup();
                self.load_ids(ids)
            }
            Err(e) => {
                tracing::warn!(error = %e, "cache: listing identities failed; cache unchanged");
                LoadReport::default()
            }
        }
    }

    /// Empty the cache.
    pub fn clear(&self) {
        let mut gallery = self.gallery.write().unwrap_or_else(PoisonError::into_inner);
        let dropped = gallery.embedding_count();
        *gallery = Gallery::default();
        tracing::info!(dropped, "cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        let gallery = self.read();
        CacheStats {
            identity_count: gallery.identity_count(),
            embedding_count: gallery.embedding_count(),
            approx_size_bytes: gallery.approx_size_bytes(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Run `matcher` against the cached gallery under the read lock.
    pub fn search(
        &self,
        matcher: &dyn Matcher,
        query: &[f32],
        threshold: f64,
        top_k: usize,
    ) -> MatchResult {
        let gallery = self.read();
        matcher.find(query, &gallery, threshold, top_k)
    }

    fn read(&self) -> RwLockReadGuard<'_, Gallery> {
        self.gallery.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_ids(&self, ids: Vec<String>) -> LoadReport {
        let mut report = LoadReport {
            requested: ids.len(),
            ..LoadReport::default()
        };

        // Fetch and validate outside the lock.
        let mut fetched: Vec<(String, Vec<Embedding>)> = Vec::with_capacity(ids.len());
        for id in ids {
            let records = match self.source.fetch_embeddings(std::slice::from_ref(&id)) {
                Ok(mut map) => map.remove(&id).unwrap_or_default(),
                Err(e) => {
                    tracing::warn!(identity = %id, error = %e, "cache: fetch failed; skipping identity");
                    report.failed_identities.push(id);
                    continue;
                }
            };

            let mut embeddings = Vec::with_capacity(records.len());
            for record in records {
                if record.identity_id != id {
                    tracing::warn!(
                        identity = %id,
                        got = %record.identity_id,
                        "cache: source returned embedding for another identity; rejected"
                    );
                    report.rejected_embeddings += 1;
                    continue;
                }
                match Embedding::try_from(record) {
                    Ok(e) => embeddings.push(e),
                    Err(e) => {
                        tracing::warn!(identity = %id, error = %e, "cache: malformed embedding rejected");
                        report.rejected_embeddings += 1;
                    }
                }
            }
            fetched.push((id, embeddings));
        }

        let mut gallery = self.gallery.write().unwrap_or_else(PoisonError::into_inner);
        for (id, mut embeddings) in fetched {
            let room = self
                .max_embeddings
                .saturating_sub(gallery.count_excluding(&id));
            if embeddings.len() > room {
                tracing::warn!(
                    identity = %id,
                    dropped = embeddings.len() - room,
                    max = self.max_embeddings,
                    "cache: capacity reached; dropping embeddings"
                );
                embeddings.truncate(room);
                report.truncated = true;
            }
            report.loaded_identities += 1;
            report.loaded_embeddings += embeddings.len();
            gallery.replace(id, embeddings);
        }

        tracing::info!(
            requested = report.requested,
            identities = report.loaded_identities,
            embeddings = report.loaded_embeddings,
            rejected = report.rejected_embeddings,
            failed = report.failed_identities.len(),
            total = gallery.embedding_count(),
            "cache loaded"
        );
        report
    }
}
