//! Frame-processing orchestrator.
//!
//! One [`Pipeline`] per recognition session. Each admitted frame walks the
//! stages in a fixed order and stops at the first one that fails:
//!
//! ```text
//! admit -> detect -> dedup/select -> quality -> embed+match -> liveness
//! ```
//!
//! Soft failures (no face, low quality, no match, spoof) are verdict statuses.
//! Stage errors and panics are caught here and reported as `ERROR`.

use crate::cache::{EmbeddingCache, LoadReport};
use crate::config::{InvalidConfig, OperatingMode, PipelineConfig, SubjectSelection};
use crate::dedup::suppress_duplicates;
use crate::matcher::{CosineMatcher, Matcher};
use crate::quality::{dynamic_threshold, LandmarkQualityAssessor, QualityAssessor};
use crate::spoof::{HeuristicSpoofScorer, SpoofScorer};
use crate::types::{validate_vector, DetectedFace, EmbeddingError, Frame};
use crate::verdict::{FrameReport, PipelineVerdict, VerdictStatus};
use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector timed out after {0:?}")]
    Timeout(Duration),
    #[error("detector failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("face region could not be extracted: {0}")]
    InvalidRegion(String),
    #[error("embedder failed: {0}")]
    Failed(String),
}

/// Internal fault inside one stage. Surfaced as an `ERROR` verdict, never returned.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Detector(#[from] DetectorError),
    #[error(transparent)]
    Embedder(#[from] EmbedderError),
    #[error("embedder produced an invalid vector: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("stage panicked: {0}")]
    Panic(String),
    #[error("pipeline has been disposed")]
    Disposed,
}

/// Finds faces in a frame.
pub trait FaceDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedFace>, DetectorError>;

    /// Release model or device resources. Called once from `dispose`.
    fn release(&mut self) {}
}

/// Turns a detected face into a 128-dimension identity embedding.
pub trait FaceEmbedder: Send {
    fn embed(&mut self, frame: &Frame, face: &DetectedFace) -> Result<Vec<f32>, EmbedderError>;

    fn release(&mut self) {}
}

/// Which identities to load into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preload {
    All,
    Identities(HashSet<String>),
}

pub struct Pipeline<D, E> {
    detector: D,
    embedder: E,
    cache: Arc<EmbeddingCache>,
    assessor: Box<dyn QualityAssessor>,
    matcher: Box<dyn Matcher>,
    spoof_scorer: Box<dyn SpoofScorer>,
    config: PipelineConfig,
    frame_counter: u64,
    disposed: bool,
}

impl<D: FaceDetector, E: FaceEmbedder> Pipeline<D, E> {
    /// Build a pipeline with the default assessor, matcher, and spoof scorer.
    pub fn new(
        detector: D,
        embedder: E,
        cache: Arc<EmbeddingCache>,
        config: PipelineConfig,
    ) -> Result<Self, InvalidConfig> {
        config.validate()?;
        tracing::info!(
            mode = config.mode.as_str(),
            camera = ?config.mode.camera_facing(),
            skip_interval = config.skip_interval,
            min_quality = config.min_quality_percent,
            "pipeline created"
        );
        Ok(Self {
            detector,
            embedder,
            cache,
            assessor: Box::new(LandmarkQualityAssessor::new(config.max_pose_angle)),
            matcher: Box::new(CosineMatcher),
            spoof_scorer: Box::new(HeuristicSpoofScorer::new(
                config.spoof_weights,
                config.spoof_threshold,
                config.min_eye_displacement,
            )),
            config,
            frame_counter: 0,
            disposed: false,
        })
    }

    pub fn with_assessor(mut self, assessor: impl QualityAssessor + 'static) -> Self {
        self.assessor = Box::new(assessor);
        self
    }

    pub fn with_matcher(mut self, matcher: impl Matcher + 'static) -> Self {
        self.matcher = Box::new(matcher);
        self
    }

    pub fn with_spoof_scorer(mut self, scorer: impl SpoofScorer + 'static) -> Self {
        self.spoof_scorer = Box::new(scorer);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn mode(&self) -> OperatingMode {
        self.config.mode
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Frames seen so far, admitted or not.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Switch operating mode. Cross-frame liveness state is dropped because
    /// the camera changes with the mode.
    pub fn set_mode(&mut self, mode: OperatingMode) {
        if mode == self.config.mode {
            return;
        }
        tracing::info!(from = self.config.mode.as_str(), to = mode.as_str(), "operating mode changed");
        self.config.mode = mode;
        self.spoof_scorer.reset();
    }

    /// Populate the embedding cache. Must complete before frames are processed.
    pub fn preload(&self, which: Preload) -> LoadReport {
        match which {
            Preload::All => self.cache.load_all(),
            Preload::Identities(ids) => self.cache.load(&ids),
        }
    }

    /// Release collaborator resources and the cache contents. Later frames
    /// report `ERROR`.
    ///
    /// The cache is cleared only when this pipeline holds the last reference
    /// to it; a cache shared with other pipelines is left loaded for them.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        if Arc::strong_count(&self.cache) == 1 {
            self.cache.clear();
        } else {
            tracing::debug!(
                holders = Arc::strong_count(&self.cache),
                "cache shared with other pipelines; leaving it loaded"
            );
        }
        self.spoof_scorer.reset();
        self.detector.release();
        self.embedder.release();
        self.disposed = true;
        tracing::info!(frames = self.frame_counter, "pipeline disposed");
    }

    /// Process one camera frame. Never fails and never panics outward.
    pub fn process_frame(&mut self, frame: &Frame) -> FrameReport {
        self.frame_counter += 1;
        let index = self.frame_counter;

        if self.disposed {
            return FrameReport::single(index, PipelineVerdict::error(PipelineError::Disposed.to_string()));
        }
        if index % self.config.skip_interval != 0 {
            return FrameReport::single(index, PipelineVerdict::skipped());
        }

        let verdicts = match panic::catch_unwind(AssertUnwindSafe(|| self.run(frame))) {
            Ok(Ok(verdicts)) => verdicts,
            Ok(Err(e)) => {
                tracing::error!(frame = index, error = %e, "frame processing failed");
                vec![PipelineVerdict::error(e.to_string())]
            }
            Err(payload) => {
                let e = PipelineError::Panic(panic_message(payload.as_ref()));
                tracing::error!(frame = index, error = %e, "frame processing panicked");
                vec![PipelineVerdict::error(e.to_string())]
            }
        };

        for v in &verdicts {
            tracing::debug!(
                frame = index,
                status = %v.status,
                tracking_id = ?v.tracking_id,
                identity = ?v.identity.as_ref().map(|c| c.identity_id.as_str()),
                "frame verdict"
            );
        }

        FrameReport {
            frame_index: index,
            verdicts,
        }
    }

    fn run(&mut self, frame: &Frame) -> Result<Vec<PipelineVerdict>, PipelineError> {
        let faces = self.detector.detect(frame)?;
        if faces.is_empty() {
            return Ok(vec![PipelineVerdict::no_face()]);
        }

        let detected = faces.len();
        let faces = suppress_duplicates(faces, self.config.iou_threshold);
        let subjects = select_subjects(faces, self.config.mode, self.config.subject_selection);
        tracing::trace!(detected, subjects = subjects.len(), "subjects selected");

        // Subjects are independent; one failing does not void the others.
        let verdicts = subjects
            .iter()
            .map(|face| {
                self.evaluate(frame, face).unwrap_or_else(|e| {
                    tracing::warn!(tracking_id = ?face.tracking_id, error = %e, "subject evaluation failed");
                    let mut v = PipelineVerdict::error(e.to_string());
                    v.tracking_id = face.tracking_id;
                    v.bounds = Some(face.bounds);
                    v
                })
            })
            .collect();
        Ok(verdicts)
    }

    /// Quality gate, match, then liveness for one subject.
    fn evaluate(&mut self, frame: &Frame, face: &DetectedFace) -> Result<PipelineVerdict, PipelineError> {
        let mut verdict = PipelineVerdict::for_face(face);

        let quality = self.assessor.assess(face);
        verdict.quality = Some(quality);
        verdict.confidence.quality = quality.fraction();
        if quality.percent < self.config.min_quality_percent {
            verdict.status = VerdictStatus::LowQuality;
            verdict.message = format!(
                "face quality {}% below minimum {}%",
                quality.percent, self.config.min_quality_percent
            );
            return Ok(verdict);
        }
        verdict.quality_ok = true;

        let threshold = (dynamic_threshold(quality.percent) + self.config.mode.threshold_boost()).min(1.0);
        let query = self.embedder.embed(frame, face)?;
        validate_vector(&query)?;

        let result = self
            .cache
            .search(self.matcher.as_ref(), &query, threshold, self.config.top_k);
        let Some(best) = result.best().cloned() else {
            verdict.status = VerdictStatus::DetectedOnly;
            verdict.message = format!("no enrolled identity at similarity >= {threshold:.2}");
            return Ok(verdict);
        };
        verdict.recognized = true;
        verdict.confidence.recognition = best.similarity;

        let spoof = self.spoof_scorer.score(face, frame);
        verdict.confidence.liveness = 1.0 - spoof.risk_score;
        if spoof.is_spoofed {
            verdict.status = VerdictStatus::Spoofed;
            verdict.message = format!(
                "presentation attack suspected for {} (risk {:.2}, {:?})",
                best.identity_id, spoof.risk_score, spoof.risk_level
            );
        } else {
            verdict.live = true;
            verdict.status = VerdictStatus::Recognized;
            verdict.message = format!("recognized {} ({:.3})", best.display_name, best.similarity);
        }
        verdict.identity = Some(best);
        verdict.spoof = Some(spoof);
        Ok(verdict)
    }
}

/// Apply the mode's subject limit. Faces arrive deduplicated in detector order.
fn select_subjects(
    mut faces: Vec<DetectedFace>,
    mode: OperatingMode,
    selection: SubjectSelection,
) -> Vec<DetectedFace> {
    let Some(limit) = mode.max_subjects() else {
        return faces;
    };
    if selection == SubjectSelection::Largest {
        // Stable: equal areas keep detector order.
        faces.sort_by(|a, b| {
            b.bounds
                .area()
                .partial_cmp(&a.bounds.area())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
    }
    faces.truncate(limit);
    faces
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
