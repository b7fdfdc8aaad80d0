use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Dimension of every enrolled and query embedding.
pub const EMBEDDING_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("invalid embedding dimension: {0} (expected {EMBEDDING_DIM})")]
    InvalidDimension(usize),
    #[error("invalid embedding value (NaN/Inf) at index {0}")]
    NonFiniteValue(usize),
}

/// A point in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// Axis-aligned rectangle in frame coordinates (top-left origin).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    /// Area of the rectangle. Negative extents count as zero.
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Whether `p` lies inside the rectangle (edges inclusive).
    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x <= self.x + self.width && p.y >= self.y && p.y <= self.y + self.height
    }

    /// Intersection-over-Union with another rectangle.
    ///
    /// Degenerate rectangles (zero union area) and rectangles with any
    /// non-finite coordinate yield 0.0, never NaN.
    pub fn iou(&self, other: &Rect) -> f32 {
        if !(self.is_finite() && other.is_finite()) {
            return 0.0;
        }
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let inter_w = (x2 - x1).max(0.0);
        let inter_h = (y2 - y1).max(0.0);
        let inter_area = inter_w * inter_h;

        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.width.is_finite() && self.height.is_finite()
    }

    /// Clip to a `width` x `height` frame and return the pixel span
    /// `(x0, y0, x1, y1)` (exclusive upper bounds), or `None` if nothing remains.
    pub fn pixel_span(&self, width: u32, height: u32) -> Option<(usize, usize, usize, usize)> {
        if !self.is_finite() {
            return None;
        }
        let x0 = self.x.floor().clamp(0.0, width as f32) as usize;
        let y0 = self.y.floor().clamp(0.0, height as f32) as usize;
        let x1 = (self.x + self.width).ceil().clamp(0.0, width as f32) as usize;
        let y1 = (self.y + self.height).ceil().clamp(0.0, height as f32) as usize;
        if x1 > x0 && y1 > y0 {
            Some((x0, y0, x1, y1))
        } else {
            None
        }
    }
}

/// Named facial landmarks a detector may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LandmarkKind {
    LeftEye,
    RightEye,
    NoseBase,
    LeftCheek,
    RightCheek,
    MouthLeft,
    MouthRight,
    MouthBottom,
    LeftEar,
    RightEar,
}

impl LandmarkKind {
    /// The full landmark set a complete detection carries.
    pub const ALL: [LandmarkKind; 10] = [
        LandmarkKind::LeftEye,
        LandmarkKind::RightEye,
        LandmarkKind::NoseBase,
        LandmarkKind::LeftCheek,
        LandmarkKind::RightCheek,
        LandmarkKind::MouthLeft,
        LandmarkKind::MouthRight,
        LandmarkKind::MouthBottom,
        LandmarkKind::LeftEar,
        LandmarkKind::RightEar,
    ];

    /// Eyes, nose and mouth corners: the points that stay visible on a
    /// well-lit frontal face.
    pub const CORE: [LandmarkKind; 5] = [
        LandmarkKind::LeftEye,
        LandmarkKind::RightEye,
        LandmarkKind::NoseBase,
        LandmarkKind::MouthLeft,
        LandmarkKind::MouthRight,
    ];
}

/// One face found in a frame by the detector.
///
/// Created fresh per detector call and consumed within the same pipeline pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bounds: Rect,
    pub landmarks: BTreeMap<LandmarkKind, Point>,
    /// Head yaw in degrees (left/right turn).
    pub yaw: f32,
    /// Head roll in degrees (in-plane tilt).
    pub roll: f32,
    /// Tracker id, stable across consecutive frames for the same physical face.
    pub tracking_id: Option<u64>,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
}

impl DetectedFace {
    /// A frontal face with no landmarks and full detector confidence.
    pub fn new(bounds: Rect) -> Self {
        Self {
            bounds,
            landmarks: BTreeMap::new(),
            yaw: 0.0,
            roll: 0.0,
            tracking_id: None,
            confidence: 1.0,
        }
    }

    pub fn landmark(&self, kind: LandmarkKind) -> Option<Point> {
        self.landmarks.get(&kind).copied()
    }

    /// Fraction of `expected` landmarks that are present, in [0, 1].
    pub fn landmark_completeness(&self, expected: &[LandmarkKind]) -> f32 {
        if expected.is_empty() {
            return 1.0;
        }
        let present = expected.iter().filter(|k| self.landmarks.contains_key(k)).count();
        present as f32 / expected.len() as f32
    }

    /// Both eye centres, if the detector reported them.
    pub fn eyes(&self) -> Option<(Point, Point)> {
        Some((
            self.landmark(LandmarkKind::LeftEye)?,
            self.landmark(LandmarkKind::RightEye)?,
        ))
    }
}

/// A decoded grayscale camera frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data, row-major (width * height bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self { data, width, height }
    }

    /// Whether the pixel buffer covers the declared dimensions.
    pub fn is_complete(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() >= self.width as usize * self.height as usize
    }

    #[inline]
    pub(crate) fn pixel(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width as usize + x]
    }
}

/// An embedding as delivered by the persistence collaborator, not yet validated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub identity_id: String,
    pub display_name: String,
    pub values: Vec<f32>,
    pub enrolled_at: DateTime<Utc>,
}

/// A validated reference embedding owned by the cache.
///
/// Built from exactly [`EMBEDDING_DIM`] finite values. Only the unit-length
/// copy used for matching is kept, computed once in double precision at
/// ingestion.
#[derive(Debug, Clone)]
pub struct Embedding {
    identity_id: String,
    display_name: String,
    unit: Vec<f64>,
}

impl Embedding {
    pub fn identity_id(&self) -> &str {
        &self.identity_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Unit-length copy of the values (all zeros for a zero-magnitude vector).
    pub fn unit(&self) -> &[f64] {
        &self.unit
    }
}

impl TryFrom<EmbeddingRecord> for Embedding {
    type Error = EmbeddingError;

    fn try_from(record: EmbeddingRecord) -> Result<Self, Self::Error> {
        validate_vector(&record.values)?;
        let unit = unit_vector(&record.values);
        Ok(Self {
            identity_id: record.identity_id,
            display_name: record.display_name,
            unit,
        })
    }
}

/// Check the ingestion contract: exactly [`EMBEDDING_DIM`] finite values.
pub fn validate_vector(values: &[f32]) -> Result<(), EmbeddingError> {
    if values.len() != EMBEDDING_DIM {
        return Err(EmbeddingError::InvalidDimension(values.len()));
    }
    if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
        return Err(EmbeddingError::NonFiniteValue(idx));
    }
    Ok(())
}

/// Normalize to unit length in double precision. Zero vectors stay zero.
pub fn unit_vector(values: &[f32]) -> Vec<f64> {
    let norm = values
        .iter()
        .map(|&v| (v as f64) * (v as f64))
        .sum::<f64>()
        .sqrt();
    if norm > 0.0 {
        values.iter().map(|&v| v as f64 / norm).collect()
    } else {
        vec![0.0; values.len()]
    }
}

/// Cosine similarity in [-1, 1], computed in double precision.
///
/// A zero-magnitude operand yields 0.0, never NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 {
        (dot / denom).clamp(-1.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: f32, y: f32, w: f32, h: f32) -> Rect {
        Rect::new(x, y, w, h)
    }

    #[test]
    fn test_iou_identical() {
        let a = rect(0.0, 0.0, 100.0, 100.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = rect(0.0, 0.0, 10.0, 10.0);
        let b = rect(20.0, 20.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_iou_partial() {
        let a = rect(0.0, 0.0, 10.0, 10.0);
        let b = rect(5.0, 0.0, 10.0, 10.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_zero_area() {
        let a = rect(5.0, 5.0, 0.0, 0.0);
        let b = rect(0.0, 0.0, 10.0, 10.0);
        assert_eq!(a.iou(&b), 0.0);
        assert_eq!(a.iou(&a), 0.0);
        assert_eq!(b.iou(&a), 0.0);
    }

    #[test]
    fn test_iou_symmetric() {
        let a = rect(0.0, 0.0, 12.0, 8.0);
        let b = rect(3.0, 2.0, 10.0, 10.0);
        assert!((a.iou(&b) - b.iou(&a)).abs() < 1e-6);
    }

    #[test]
    fn test_iou_non_finite_is_zero() {
        let real = rect(0.0, 0.0, 10.0, 10.0);
        let nan = rect(f32::NAN, 0.0, 10.0, 10.0);
        let inf = rect(0.0, 0.0, f32::INFINITY, 10.0);
        assert_eq!(nan.iou(&real), 0.0);
        assert_eq!(real.iou(&nan), 0.0);
        assert_eq!(inf.iou(&real), 0.0);
        assert_eq!(nan.iou(&nan), 0.0);
        assert!(!nan.is_finite());
        assert!(real.is_finite());
    }

    #[test]
    fn test_pixel_span_clips_to_frame() {
        let r = rect(-10.0, 5.0, 50.0, 200.0);
        assert_eq!(r.pixel_span(32, 24), Some((0, 5, 32, 24)));
        assert_eq!(rect(40.0, 40.0, 5.0, 5.0).pixel_span(32, 24), None);
        assert_eq!(rect(f32::NAN, 0.0, 5.0, 5.0).pixel_span(32, 24), None);
    }

    #[test]
    fn test_validate_rejects_wrong_dimension() {
        let values = vec![0.5f32; 512];
        assert_eq!(validate_vector(&values), Err(EmbeddingError::InvalidDimension(512)));
    }

    #[test]
    fn test_validate_rejects_nan_and_inf() {
        let mut values = vec![0.5f32; EMBEDDING_DIM];
        values[42] = f32::NAN;
        assert_eq!(validate_vector(&values), Err(EmbeddingError::NonFiniteValue(42)));
        values[42] = 0.0;
        values[0] = f32::INFINITY;
        assert_eq!(validate_vector(&values), Err(EmbeddingError::NonFiniteValue(0)));
    }

    #[test]
    fn test_embedding_try_from_normalizes() {
        let mut values = vec![0.0f32; EMBEDDING_DIM];
        values[0] = 3.0;
        values[1] = 4.0;
        let emb = Embedding::try_from(EmbeddingRecord {
            identity_id: "S1".into(),
            display_name: "Ada".into(),
            values,
            enrolled_at: Utc::now(),
        })
        .unwrap();
        assert!((emb.unit()[0] - 0.6).abs() < 1e-12);
        assert!((emb.unit()[1] - 0.8).abs() < 1e-12);
        assert_eq!(emb.identity_id(), "S1");
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = [1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_similarity_orthogonal_and_opposite() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-12);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_similarity_bounded_and_symmetric() {
        let vectors: Vec<Vec<f32>> = (0..8)
            .map(|k| {
                (0..EMBEDDING_DIM)
                    .map(|i| ((i * (k + 3)) % 17) as f32 - 8.0 + k as f32 * 0.25)
                    .collect()
            })
            .collect();
        for a in &vectors {
            for b in &vectors {
                let ab = cosine_similarity(a, b);
                let ba = cosine_similarity(b, a);
                assert!((-1.0..=1.0).contains(&ab));
                assert_eq!(ab, ba);
            }
        }
    }

    #[test]
    fn test_landmark_completeness() {
        let mut face = DetectedFace::new(rect(0.0, 0.0, 10.0, 10.0));
        assert_eq!(face.landmark_completeness(&LandmarkKind::ALL), 0.0);
        face.landmarks.insert(LandmarkKind::LeftEye, Point::new(2.0, 3.0));
        face.landmarks.insert(LandmarkKind::RightEye, Point::new(7.0, 3.0));
        assert!((face.landmark_completeness(&LandmarkKind::ALL) - 0.2).abs() < 1e-6);
        assert!((face.landmark_completeness(&LandmarkKind::CORE) - 0.4).abs() < 1e-6);
        assert!(face.eyes().is_some());
    }
}
