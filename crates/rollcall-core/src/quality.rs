//! Per-face quality scoring.
//!
//! The default assessor has no access to pixels. It approximates blur and
//! low-light from landmark completeness (a detector drops landmarks first on
//! soft or dark faces) and pose from the reported head angles. Genuine
//! sharpness or exposure analysis can replace it behind [`QualityAssessor`].

use crate::types::{DetectedFace, LandmarkKind};
use serde::{Deserialize, Serialize};

/// Default maximum head angle (|yaw| + |roll|, degrees) mapped to a full pose penalty.
pub const DEFAULT_MAX_POSE_ANGLE: f32 = 30.0;

/// Quality of one detected face.
///
/// Each component is a penalty in [0, 1] (0 = ideal). `percent` is
/// `round(100 * (1 - mean(components)))`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    pub blur: f32,
    pub low_light: f32,
    pub pose: f32,
    pub percent: u8,
}

impl QualityScore {
    pub fn from_components(blur: f32, low_light: f32, pose: f32) -> Self {
        let blur = sanitize(blur);
        let low_light = sanitize(low_light);
        let pose = sanitize(pose);
        let mean = (blur + low_light + pose) / 3.0;
        let percent = (100.0 * (1.0 - mean)).round().clamp(0.0, 100.0) as u8;
        Self {
            blur,
            low_light,
            pose,
            percent,
        }
    }

    /// Percentage as a fraction in [0, 1], for confidence reporting.
    pub fn fraction(&self) -> f32 {
        self.percent as f32 / 100.0
    }
}

fn sanitize(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Strategy for scoring a detected face. Must not fail.
pub trait QualityAssessor: Send {
    fn assess(&self, face: &DetectedFace) -> QualityScore;
}

/// Landmark- and pose-based quality proxy.
#[derive(Debug, Clone)]
pub struct LandmarkQualityAssessor {
    max_pose_angle: f32,
}

impl LandmarkQualityAssessor {
    pub fn new(max_pose_angle: f32) -> Self {
        Self { max_pose_angle }
    }

    fn pose_penalty(&self, face: &DetectedFace) -> f32 {
        let angle = face.yaw.abs() + face.roll.abs();
        if !angle.is_finite() {
            return 1.0;
        }
        if self.max_pose_angle <= 0.0 {
            return if angle > 0.0 { 1.0 } else { 0.0 };
        }
        angle.clamp(0.0, self.max_pose_angle) / self.max_pose_angle
    }
}

impl Default for LandmarkQualityAssessor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_POSE_ANGLE)
    }
}

impl QualityAssessor for LandmarkQualityAssessor {
    fn assess(&self, face: &DetectedFace) -> QualityScore {
        let blur = 1.0 - face.landmark_completeness(&LandmarkKind::ALL);
        let low_light = 1.0 - face.landmark_completeness(&LandmarkKind::CORE);
        QualityScore::from_components(blur, low_light, self.pose_penalty(face))
    }
}

/// Minimum cosine similarity required for a face of the given quality.
///
/// Lower quality demands a closer match:
/// >= 90 -> 0.60, 75..=89 -> 0.70, 60..=74 -> 0.80, below 60 -> 0.90.
pub fn dynamic_threshold(percent: u8) -> f64 {
    match percent {
        90..=u8::MAX => 0.60,
        75..=89 => 0.70,
        60..=74 => 0.80,
        _ => 0.90,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Point, Rect};

    fn face_with(landmarks: &[LandmarkKind], yaw: f32, roll: f32) -> DetectedFace {
        let mut face = DetectedFace::new(Rect::new(0.0, 0.0, 100.0, 100.0));
        for (i, kind) in landmarks.iter().enumerate() {
            face.landmarks.insert(*kind, Point::new(10.0 + i as f32, 20.0));
        }
        face.yaw = yaw;
        face.roll = roll;
        face
    }

    #[test]
    fn test_perfect_face_scores_100() {
        let q = LandmarkQualityAssessor::default().assess(&face_with(&LandmarkKind::ALL, 0.0, 0.0));
        assert_eq!(q.percent, 100);
        assert_eq!(q.blur, 0.0);
        assert_eq!(q.low_light, 0.0);
        assert_eq!(q.pose, 0.0);
    }

    #[test]
    fn test_no_landmarks_extreme_pose_scores_0() {
        let q = LandmarkQualityAssessor::default().assess(&face_with(&[], 45.0, 10.0));
        assert_eq!(q.percent, 0);
        assert_eq!(q.pose, 1.0);
    }

    #[test]
    fn test_percent_formula() {
        // Core landmarks only: blur 0.5, low_light 0.0; 15 degrees: pose 0.5.
        let q = LandmarkQualityAssessor::default().assess(&face_with(&LandmarkKind::CORE, 10.0, -5.0));
        assert!((q.blur - 0.5).abs() < 1e-6);
        assert_eq!(q.low_light, 0.0);
        assert!((q.pose - 0.5).abs() < 1e-6);
        // 100 * (1 - 1.0 / 3) = 66.67
        assert_eq!(q.percent, 67);
    }

    #[test]
    fn test_pose_monotonic() {
        let assessor = LandmarkQualityAssessor::default();
        for landmarks in [&LandmarkKind::ALL[..], &LandmarkKind::CORE[..], &[][..]] {
            let mut previous = u8::MAX;
            for step in 0..=90 {
                let yaw = step as f32;
                let q = assessor.assess(&face_with(landmarks, yaw, 0.0));
                assert!(q.percent <= previous, "yaw {yaw}: {} > {previous}", q.percent);
                previous = q.percent;

                let negative = assessor.assess(&face_with(landmarks, -yaw, 0.0));
                assert_eq!(negative.percent, q.percent);
            }
        }
    }

    #[test]
    fn test_non_finite_pose_is_worst_case() {
        let q = LandmarkQualityAssessor::default().assess(&face_with(&LandmarkKind::ALL, f32::NAN, 0.0));
        assert_eq!(q.pose, 1.0);
    }

    #[test]
    fn test_dynamic_threshold_bands() {
        assert_eq!(dynamic_threshold(100), 0.60);
        assert_eq!(dynamic_threshold(90), 0.60);
        assert_eq!(dynamic_threshold(89), 0.70);
        assert_eq!(dynamic_threshold(75), 0.70);
        assert_eq!(dynamic_threshold(74), 0.80);
        assert_eq!(dynamic_threshold(60), 0.80);
        assert_eq!(dynamic_threshold(59), 0.90);
        assert_eq!(dynamic_threshold(0), 0.90);
    }

    #[test]
    fn test_dynamic_threshold_monotonic() {
        for q1 in 0..=100u8 {
            for q2 in q1..=100u8 {
                assert!(dynamic_threshold(q1) >= dynamic_threshold(q2));
            }
        }
    }
}
