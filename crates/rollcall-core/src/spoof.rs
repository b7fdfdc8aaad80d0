//! Presentation-attack (spoof) scoring from five weak heuristics.
//!
//! Each sub-analysis returns a value in [0, 1] where 1 means "looks fake":
//!
//! - **texture**: local-binary-pattern code variance over the face crop.
//!   Prints and screens are smoother than skin, so low variance scores high.
//! - **landmarks**: share of the expected landmark set that was detected
//!   *inside* the face box.
//! - **frequency**: mean 4-neighbour Laplacian magnitude over the crop.
//!   Flat, low-detail regions score high.
//! - **eye reflection**: whether both eye landmarks were found, a coarse
//!   stand-in for specular highlight plausibility.
//! - **motion**: tracking continuity. A tracked face whose eyes hold perfectly
//!   still across frames behaves like a photograph; a live subject shows
//!   involuntary micro-movement of a pixel or more between frames.
//!
//! A sub-analysis that lacks data (no pixels, crop too small) reports the
//! neutral 0.5 so a missing signal lowers confidence instead of failing.
//!
//! # Threat coverage
//!
//! - **Blocks:** printed photographs and static images held to the camera.
//! - **Does not block:** video replays with natural motion, 3D masks.

use crate::types::{DetectedFace, Frame, LandmarkKind, Point};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// Value reported by a sub-analysis that cannot run.
pub const NEUTRAL_SCORE: f64 = 0.5;
/// Default decision threshold on the combined risk score.
pub const DEFAULT_SPOOF_THRESHOLD: f64 = 0.5;
/// Default minimum mean eye displacement (pixels) between consecutive frames
/// of the same track. Sensor noise on a static print stays under ~0.3 px.
pub const DEFAULT_MIN_EYE_DISPLACEMENT: f32 = 0.8;

/// LBP code variance treated as fully "natural" texture.
const LBP_VARIANCE_REFERENCE: f64 = 5000.0;
/// Mean absolute Laplacian response treated as full high-frequency energy.
const LAPLACIAN_REFERENCE: f64 = 20.0;
/// Longest side sampled when walking a face crop.
const MAX_SAMPLES_PER_SIDE: usize = 128;
/// Frames of eye positions kept per track.
const MOTION_HISTORY_LEN: usize = 5;
/// Tracks kept before the history is reset.
const MAX_TRACKED_FACES: usize = 64;

const EYES_BOTH_SCORE: f64 = 0.2;
const EYES_ONE_SCORE: f64 = 0.6;
const EYES_NONE_SCORE: f64 = 0.9;
const MOTION_LIVE_SCORE: f64 = 0.1;
const MOTION_FRESH_TRACK_SCORE: f64 = 0.3;
const MOTION_STATIC_SCORE: f64 = 0.8;

/// The five sub-analysis scores, each in [0, 1] (1 = looks fake).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpoofComponents {
    pub texture: f64,
    pub landmarks: f64,
    pub frequency: f64,
    pub eye_reflection: f64,
    pub motion: f64,
}

impl SpoofComponents {
    /// Every component at the same value.
    pub fn uniform(value: f64) -> Self {
        Self {
            texture: value,
            landmarks: value,
            frequency: value,
            eye_reflection: value,
            motion: value,
        }
    }
}

/// Relative weight of each sub-analysis. A zero weight omits that analysis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpoofWeights {
    pub texture: f64,
    pub landmarks: f64,
    pub frequency: f64,
    pub eye_reflection: f64,
    pub motion: f64,
}

impl Default for SpoofWeights {
    fn default() -> Self {
        Self {
            texture: 0.30,
            landmarks: 0.25,
            frequency: 0.25,
            eye_reflection: 0.10,
            motion: 0.10,
        }
    }
}

impl SpoofWeights {
    pub fn total(&self) -> f64 {
        self.texture + self.landmarks + self.frequency + self.eye_reflection + self.motion
    }

    pub fn is_valid(&self) -> bool {
        let all = [
            self.texture,
            self.landmarks,
            self.frequency,
            self.eye_reflection,
            self.motion,
        ];
        all.iter().all(|w| w.is_finite() && *w >= 0.0) && self.total() > 0.0
    }

    /// Weighted mean of `c`, normalized by the total weight.
    pub fn combine(&self, c: &SpoofComponents) -> f64 {
        let total = self.total();
        if !(total > 0.0) {
            return NEUTRAL_SCORE;
        }
        let sum = self.texture * c.texture
            + self.landmarks * c.landmarks
            + self.frequency * c.frequency
            + self.eye_reflection * c.eye_reflection
            + self.motion * c.motion;
        (sum / total).clamp(0.0, 1.0)
    }
}

/// Reporting bucket for a risk score. Not used for the pass/fail decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s < 0.2 => RiskLevel::Safe,
            s if s < 0.4 => RiskLevel::Low,
            s if s < 0.6 => RiskLevel::Medium,
            s if s < 0.8 => RiskLevel::High,
            _ => RiskLevel::Critical,
        }
    }
}

/// Spoof assessment of one face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpoofVerdict {
    pub components: SpoofComponents,
    pub risk_score: f64,
    pub risk_level: RiskLevel,
    pub is_spoofed: bool,
}

impl SpoofVerdict {
    pub fn from_components(components: SpoofComponents, weights: &SpoofWeights, threshold: f64) -> Self {
        let risk_score = weights.combine(&components);
        Self {
            components,
            risk_score,
            risk_level: RiskLevel::from_score(risk_score),
            is_spoofed: risk_score >= threshold,
        }
    }
}

/// Strategy for scoring a face for presentation attacks.
pub trait SpoofScorer: Send {
    fn score(&mut self, face: &DetectedFace, frame: &Frame) -> SpoofVerdict;

    /// Drop any cross-frame state.
    fn reset(&mut self) {}
}

/// Default scorer combining the five heuristics described in the module docs.
pub struct HeuristicSpoofScorer {
    weights: SpoofWeights,
    threshold: f64,
    motion: MotionHistory,
}

impl HeuristicSpoofScorer {
    pub fn new(weights: SpoofWeights, threshold: f64, min_eye_displacement: f32) -> Self {
        Self {
            weights,
            threshold,
            motion: MotionHistory::new(min_eye_displacement),
        }
    }
}

impl Default for HeuristicSpoofScorer {
    fn default() -> Self {
        Self::new(
            SpoofWeights::default(),
            DEFAULT_SPOOF_THRESHOLD,
            DEFAULT_MIN_EYE_DISPLACEMENT,
        )
    }
}

impl SpoofScorer for HeuristicSpoofScorer {
    fn score(&mut self, face: &DetectedFace, frame: &Frame) -> SpoofVerdict {
        let components = SpoofComponents {
            texture: texture_score(face, frame).unwrap_or(NEUTRAL_SCORE),
            landmarks: landmark_score(face),
            frequency: frequency_score(face, frame).unwrap_or(NEUTRAL_SCORE),
            eye_reflection: eye_reflection_score(face),
            motion: self.motion.observe(face),
        };
        let verdict = SpoofVerdict::from_components(components, &self.weights, self.threshold);
        tracing::debug!(
            tracking_id = ?face.tracking_id,
            texture = components.texture,
            landmarks = components.landmarks,
            frequency = components.frequency,
            eye_reflection = components.eye_reflection,
            motion = components.motion,
            risk = verdict.risk_score,
            spoofed = verdict.is_spoofed,
            "spoof scored"
        );
        verdict
    }

    fn reset(&mut self) {
        self.motion.clear();
    }
}

/// Face crop walk parameters: pixel span and sampling step.
struct Crop {
    x0: usize,
    y0: usize,
    x1: usize,
    y1: usize,
    step: usize,
}

impl Crop {
    /// Crop for 3x3 neighbourhood analyses, or `None` when pixel data is insufficient.
    fn for_face(face: &DetectedFace, frame: &Frame) -> Option<Self> {
        if !frame.is_complete() {
            return None;
        }
        let (x0, y0, x1, y1) = face.bounds.pixel_span(frame.width, frame.height)?;
        // Keep one pixel of margin inside the frame for the neighbourhood.
        let x0 = x0.max(1);
        let y0 = y0.max(1);
        let x1 = x1.min(frame.width as usize - 1);
        let y1 = y1.min(frame.height as usize - 1);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        let longest = (x1 - x0).max(y1 - y0);
        let step = longest.div_ceil(MAX_SAMPLES_PER_SIDE).max(1);
        Some(Self { x0, y0, x1, y1, step })
    }

    fn points(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (self.y0..self.y1)
            .step_by(self.step)
            .flat_map(move |y| (self.x0..self.x1).step_by(self.step).map(move |x| (x, y)))
    }
}

/// Neighbour offsets, clockwise from top-left.
const LBP_NEIGHBOURS: [(isize, isize); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

fn lbp_code(frame: &Frame, x: usize, y: usize) -> u8 {
    let center = frame.pixel(x, y);
    let mut code = 0u8;
    for (bit, (dx, dy)) in LBP_NEIGHBOURS.iter().enumerate() {
        let nx = (x as isize + dx) as usize;
        let ny = (y as isize + dy) as usize;
        if frame.pixel(nx, ny) >= center {
            code |= 1 << bit;
        }
    }
    code
}

/// Texture sub-analysis. `None` when pixel data is insufficient.
pub fn texture_score(face: &DetectedFace, frame: &Frame) -> Option<f64> {
    let crop = Crop::for_face(face, frame)?;

    let mut count = 0u64;
    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    for (x, y) in crop.points() {
        let code = lbp_code(frame, x, y) as f64;
        sum += code;
        sum_sq += code * code;
        count += 1;
    }
    if count == 0 {
        return None;
    }

    let mean = sum / count as f64;
    let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
    let richness = (variance / LBP_VARIANCE_REFERENCE).min(1.0);
    Some(1.0 - richness)
}

/// Frequency-domain sub-analysis. `None` when pixel data is insufficient.
pub fn frequency_score(face: &DetectedFace, frame: &Frame) -> Option<f64> {
    let crop = Crop::for_face(face, frame)?;

    let mut count = 0u64;
    let mut total = 0.0f64;
    for (x, y) in crop.points() {
        let c = frame.pixel(x, y) as f64;
        let n = frame.pixel(x, y - 1) as f64;
        let s = frame.pixel(x, y + 1) as f64;
        let w = frame.pixel(x - 1, y) as f64;
        let e = frame.pixel(x + 1, y) as f64;
        total += (4.0 * c - n - s - w - e).abs();
        count += 1;
    }
    if count == 0 {
        return None;
    }

    let energy = (total / count as f64 / LAPLACIAN_REFERENCE).min(1.0);
    Some(1.0 - energy)
}

/// Landmark-stability sub-analysis: 1 minus the share of the expected set
/// that was detected inside the face box.
pub fn landmark_score(face: &DetectedFace) -> f64 {
    let expected = LandmarkKind::ALL.len();
    let contained = LandmarkKind::ALL
        .iter()
        .filter_map(|kind| face.landmark(*kind))
        .filter(|p| face.bounds.contains(*p))
        .count();
    1.0 - contained as f64 / expected as f64
}

/// Eye-reflection sub-analysis.
pub fn eye_reflection_score(face: &DetectedFace) -> f64 {
    let left = face.landmark(LandmarkKind::LeftEye).is_some();
    let right = face.landmark(LandmarkKind::RightEye).is_some();
    match (left, right) {
        (true, true) => EYES_BOTH_SCORE,
        (true, false) | (false, true) => EYES_ONE_SCORE,
        (false, false) => EYES_NONE_SCORE,
    }
}

/// Recent eye positions per tracking id.
struct MotionHistory {
    min_displacement: f32,
    tracks: HashMap<u64, VecDeque<(Point, Point)>>,
}

impl MotionHistory {
    fn new(min_displacement: f32) -> Self {
        Self {
            min_displacement,
            tracks: HashMap::new(),
        }
    }

    fn clear(&mut self) {
        self.tracks.clear();
    }

    /// Record this observation and return the motion sub-score.
    fn observe(&mut self, face: &DetectedFace) -> f64 {
        let Some(track) = face.tracking_id else {
            return NEUTRAL_SCORE;
        };
        let Some(eyes) = face.eyes() else {
            // Tracked but eyes not visible: continuity without a measurement.
            return MOTION_FRESH_TRACK_SCORE;
        };

        if !self.tracks.contains_key(&track) && self.tracks.len() >= MAX_TRACKED_FACES {
            tracing::debug!(tracks = self.tracks.len(), "motion history full; resetting");
            self.tracks.clear();
        }
        let history = self.tracks.entry(track).or_default();
        history.push_back(eyes);
        while history.len() > MOTION_HISTORY_LEN {
            history.pop_front();
        }

        match mean_eye_displacement(history) {
            None => MOTION_FRESH_TRACK_SCORE,
            Some(d) if d >= self.min_displacement => MOTION_LIVE_SCORE,
            Some(_) => MOTION_STATIC_SCORE,
        }
    }
}

/// Mean displacement of both eyes over consecutive pairs, `None` for fewer than two samples.
fn mean_eye_displacement(history: &VecDeque<(Point, Point)>) -> Option<f32> {
    if history.len() < 2 {
        return None;
    }
    let mut total = 0.0f32;
    let mut pairs = 0usize;
    for (prev, curr) in history.iter().zip(history.iter().skip(1)) {
        let left = prev.0.distance(&curr.0);
        let right = prev.1.distance(&curr.1);
        total += (left + right) / 2.0;
        pairs += 1;
    }
    Some(total / pairs as f32)
}
