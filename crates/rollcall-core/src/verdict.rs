use crate::matcher::MatchCandidate;
use crate::quality::QualityScore;
use crate::spoof::SpoofVerdict;
use crate::types::{DetectedFace, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal state of one frame (or one subject, in multi mode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    /// Frame not admitted by the skip policy.
    Skipped,
    NoFace,
    LowQuality,
    /// A face of acceptable quality that matched no enrolled identity.
    DetectedOnly,
    /// Matched, but failed the liveness check.
    Spoofed,
    Recognized,
    /// Internal fault inside a stage.
    Error,
    /// Caller-side deadline expired before the pipeline answered.
    Timeout,
}

impl VerdictStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictStatus::Skipped => "SKIPPED",
            VerdictStatus::NoFace => "NO_FACE",
            VerdictStatus::LowQuality => "LOW_QUALITY",
            VerdictStatus::DetectedOnly => "DETECTED_ONLY",
            VerdictStatus::Spoofed => "SPOOFED",
            VerdictStatus::Recognized => "RECOGNIZED",
            VerdictStatus::Error => "ERROR",
            VerdictStatus::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for VerdictStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-stage confidence numbers, each in [0, 1]. Zero for stages not reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageConfidence {
    /// Detector confidence for the face.
    pub detection: f32,
    /// Quality percentage as a fraction.
    pub quality: f32,
    /// Similarity of the best match.
    pub recognition: f64,
    /// `1 - risk_score`.
    pub liveness: f64,
}

/// The result of one pipeline pass for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineVerdict {
    pub status: VerdictStatus,
    pub face_detected: bool,
    pub quality_ok: bool,
    pub recognized: bool,
    pub live: bool,
    /// Best match. Present for `RECOGNIZED`, and for `SPOOFED` so the rejected
    /// attempt can be audited.
    pub identity: Option<MatchCandidate>,
    pub confidence: StageConfidence,
    pub tracking_id: Option<u64>,
    pub bounds: Option<Rect>,
    pub quality: Option<QualityScore>,
    pub spoof: Option<SpoofVerdict>,
    pub message: String,
}

impl PipelineVerdict {
    /// A verdict with every stage flag false.
    fn bare(status: VerdictStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            face_detected: false,
            quality_ok: false,
            recognized: false,
            live: false,
            identity: None,
            confidence: StageConfidence::default(),
            tracking_id: None,
            bounds: None,
            quality: None,
            spoof: None,
            message: message.into(),
        }
    }

    pub fn skipped() -> Self {
        Self::bare(VerdictStatus::Skipped, "frame skipped")
    }

    pub fn no_face() -> Self {
        Self::bare(VerdictStatus::NoFace, "no face detected")
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::bare(VerdictStatus::Error, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::bare(VerdictStatus::Timeout, message)
    }

    /// Start a verdict for a detected face; stage methods below fill it in.
    pub(crate) fn for_face(face: &DetectedFace) -> Self {
        let mut verdict = Self::bare(VerdictStatus::Error, "");
        verdict.face_detected = true;
        verdict.tracking_id = face.tracking_id;
        verdict.bounds = Some(face.bounds);
        verdict.confidence.detection = face.confidence.clamp(0.0, 1.0);
        verdict
    }

    /// True iff every stage passed.
    pub fn can_admit(&self) -> bool {
        self.face_detected && self.quality_ok && self.recognized && self.live
    }
}

/// Everything `process_frame` produced for one frame.
///
/// Holds exactly one verdict for skipped, faceless, and failed frames and in
/// single-subject mode; one verdict per selected subject in multi mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameReport {
    /// Value of the frame counter when this frame was admitted or skipped.
    pub frame_index: u64,
    pub verdicts: Vec<PipelineVerdict>,
}

impl FrameReport {
    pub fn single(frame_index: u64, verdict: PipelineVerdict) -> Self {
        Self {
            frame_index,
            verdicts: vec![verdict],
        }
    }

    /// The first verdict. Always present: reports are never built empty.
    pub fn primary(&self) -> Option<&PipelineVerdict> {
        self.verdicts.first()
    }
}
