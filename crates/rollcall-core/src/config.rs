use crate::cache::DEFAULT_MAX_CACHED_EMBEDDINGS;
use crate::dedup::DEFAULT_IOU_THRESHOLD;
use crate::matcher::DEFAULT_TOP_K;
use crate::quality::DEFAULT_MAX_POSE_ANGLE;
use crate::spoof::{SpoofWeights, DEFAULT_MIN_EYE_DISPLACEMENT, DEFAULT_SPOOF_THRESHOLD};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Default admission interval: process every second frame.
pub const DEFAULT_SKIP_INTERVAL: u64 = 2;
/// Default early-exit quality, in percent.
pub const DEFAULT_MIN_QUALITY_PERCENT: u8 = 30;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid pipeline config: {field}: {reason}")]
pub struct InvalidConfig {
    pub field: &'static str,
    pub reason: String,
}

/// Which camera a mode expects to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraFacing {
    Front,
    Back,
}

/// Session operating mode, chosen once per session.
///
/// - `Single`: self-verification. One subject per frame, front camera, and a
///   stricter similarity threshold.
/// - `Multi`: group capture. Every distinct face in the frame, back camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Single,
    Multi,
}

impl OperatingMode {
    /// Added to the quality-derived similarity threshold (result clamped to 1.0).
    pub fn threshold_boost(self) -> f64 {
        match self {
            OperatingMode::Single => 0.10,
            OperatingMode::Multi => 0.0,
        }
    }

    pub fn camera_facing(self) -> CameraFacing {
        match self {
            OperatingMode::Single => CameraFacing::Front,
            OperatingMode::Multi => CameraFacing::Back,
        }
    }

    /// Subjects processed per frame; `None` means every surviving face.
    pub fn max_subjects(self) -> Option<usize> {
        match self {
            OperatingMode::Single => Some(1),
            OperatingMode::Multi => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperatingMode::Single => "single",
            OperatingMode::Multi => "multi",
        }
    }
}

impl FromStr for OperatingMode {
    type Err = InvalidConfig;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(OperatingMode::Single),
            "multi" | "group" => Ok(OperatingMode::Multi),
            other => Err(InvalidConfig {
                field: "mode",
                reason: format!("unknown operating mode '{other}' (expected single or multi)"),
            }),
        }
    }
}

/// How single-subject mode picks its subject among surviving faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectSelection {
    /// First face in detector order.
    #[default]
    First,
    /// Face with the largest bounding-box area.
    Largest,
}

/// Tunables for one pipeline instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: OperatingMode,
    /// A frame is processed iff `frame_counter % skip_interval == 0`.
    pub skip_interval: u64,
    /// IoU above which a detection is a duplicate of an earlier one.
    pub iou_threshold: f32,
    /// Faces scoring below this quality percentage exit before matching.
    pub min_quality_percent: u8,
    pub top_k: usize,
    pub spoof_threshold: f64,
    pub spoof_weights: SpoofWeights,
    /// Head angle (|yaw| + |roll|, degrees) that maps to the full pose penalty.
    pub max_pose_angle: f32,
    /// Mean eye displacement (pixels) a tracked live face shows between frames.
    pub min_eye_displacement: f32,
    pub max_cached_embeddings: usize,
    pub subject_selection: SubjectSelection,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: OperatingMode::default(),
            skip_interval: DEFAULT_SKIP_INTERVAL,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            min_quality_percent: DEFAULT_MIN_QUALITY_PERCENT,
            top_k: DEFAULT_TOP_K,
            spoof_threshold: DEFAULT_SPOOF_THRESHOLD,
            spoof_weights: SpoofWeights::default(),
            max_pose_angle: DEFAULT_MAX_POSE_ANGLE,
            min_eye_displacement: DEFAULT_MIN_EYE_DISPLACEMENT,
            max_cached_embeddings: DEFAULT_MAX_CACHED_EMBEDDINGS,
            subject_selection: SubjectSelection::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> Result<(), InvalidConfig> {
            Err(InvalidConfig {
                field,
                reason: reason.into(),
            })
        }

        if self.skip_interval == 0 {
            return invalid("skip_interval", "must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return invalid("iou_threshold", format!("{} not in [0, 1]", self.iou_threshold));
        }
        if self.min_quality_percent > 100 {
            return invalid("min_quality_percent", format!("{} exceeds 100", self.min_quality_percent));
        }
        if self.top_k == 0 {
            return invalid("top_k", "must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.spoof_threshold) {
            return invalid("spoof_threshold", format!("{} not in [0, 1]", self.spoof_threshold));
        }
        if !self.spoof_weights.is_valid() {
            return invalid("spoof_weights", "weights must be finite, non-negative, and not all zero");
        }
        if !(self.max_pose_angle.is_finite() && self.max_pose_angle > 0.0) {
            return invalid("max_pose_angle", format!("{} must be positive", self.max_pose_angle));
        }
        if !(self.min_eye_displacement.is_finite() && self.min_eye_displacement >= 0.0) {
            return invalid(
                "min_eye_displacement",
                format!("{} must be non-negative", self.min_eye_displacement),
            );
        }
        if self.max_cached_embeddings == 0 {
            return invalid("max_cached_embeddings", "must be at least 1");
        }
        Ok(())
    }
}
