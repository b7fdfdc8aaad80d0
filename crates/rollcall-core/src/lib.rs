//! Camera-frame identity verification for attendance marking.
//!
//! A [`Pipeline`] turns camera frames into [`PipelineVerdict`]s: detect faces,
//! drop duplicates, gate on quality, match against an [`EmbeddingCache`] with
//! a quality-adaptive threshold, and check liveness. Detection and embedding
//! are supplied by the caller through [`FaceDetector`] and [`FaceEmbedder`].

pub mod cache;
pub mod config;
pub mod dedup;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod spoof;
pub mod types;
pub mod verdict;

pub use cache::{CacheStats, EmbeddingCache, EmbeddingSource, Gallery, LoadReport, SourceError};
pub use config::{CameraFacing, InvalidConfig, OperatingMode, PipelineConfig, SubjectSelection};
pub use dedup::suppress_duplicates;
pub use matcher::{CosineMatcher, MatchCandidate, MatchResult, Matcher};
pub use pipeline::{
    DetectorError, EmbedderError, FaceDetector, FaceEmbedder, Pipeline, PipelineError, Preload,
};
pub use quality::{dynamic_threshold, LandmarkQualityAssessor, QualityAssessor, QualityScore};
pub use spoof::{HeuristicSpoofScorer, RiskLevel, SpoofComponents, SpoofScorer, SpoofVerdict, SpoofWeights};
pub use types::{
    cosine_similarity, DetectedFace, Embedding, EmbeddingError, EmbeddingRecord, Frame, LandmarkKind, Point,
    Rect, EMBEDDING_DIM,
};
pub use verdict::{FrameReport, PipelineVerdict, StageConfidence, VerdictStatus};
