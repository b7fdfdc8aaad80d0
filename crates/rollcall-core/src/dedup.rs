use crate::types::DetectedFace;

/// Default IoU above which two detections are treated as the same face.
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.30;

/// Remove near-duplicate detections, first-seen wins.
///
/// Faces are visited in input order; a face is dropped if its IoU with any
/// already-kept face exceeds `iou_threshold`. Unlike detector NMS this does not
/// reorder by confidence, so callers keep control over which duplicate survives.
/// Quadratic in face count, which stays small per frame.
pub fn suppress_duplicates(faces: Vec<DetectedFace>, iou_threshold: f32) -> Vec<DetectedFace> {
    let mut keep: Vec<DetectedFace> = Vec::with_capacity(faces.len());

    for face in faces {
        let duplicate = keep
            .iter()
            .any(|kept| kept.bounds.iou(&face.bounds) > iou_threshold);
        if duplicate {
            tracing::trace!(tracking_id = ?face.tracking_id, "suppressed duplicate detection");
            continue;
        }
        keep.push(face);
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Rect;

    fn face(x: f32, y: f32, w: f32, h: f32, id: u64) -> DetectedFace {
        let mut f = DetectedFace::new(Rect::new(x, y, w, h));
        f.tracking_id = Some(id);
        f
    }

    fn ids(faces: &[DetectedFace]) -> Vec<u64> {
        faces.iter().filter_map(|f| f.tracking_id).collect()
    }

    #[test]
    fn test_suppresses_overlapping_first_seen_wins() {
        let faces = vec![
            face(5.0, 5.0, 100.0, 100.0, 1),
            face(0.0, 0.0, 100.0, 100.0, 2),
            face(200.0, 200.0, 50.0, 50.0, 3),
        ];
        let result = suppress_duplicates(faces, DEFAULT_IOU_THRESHOLD);
        assert_eq!(ids(&result), vec![1, 3]);
    }

    #[test]
    fn test_already_deduplicated_list_unchanged() {
        let faces = vec![
            face(300.0, 0.0, 40.0, 40.0, 7),
            face(0.0, 0.0, 40.0, 40.0, 3),
            face(100.0, 100.0, 40.0, 40.0, 9),
            face(30.0, 0.0, 40.0, 40.0, 4), // IoU with #3 = 400 / 2800
        ];
        let result = suppress_duplicates(faces.clone(), DEFAULT_IOU_THRESHOLD);
        assert_eq!(result, faces);

        let again = suppress_duplicates(result, DEFAULT_IOU_THRESHOLD);
        assert_eq!(again, faces);
    }

    #[test]
    fn test_threshold_is_strict() {
        // IoU exactly 1/3 with threshold 1/3 is kept; anything looser drops it.
        let faces = vec![face(0.0, 0.0, 10.0, 10.0, 1), face(5.0, 0.0, 10.0, 10.0, 2)];
        let iou = faces[0].bounds.iou(&faces[1].bounds);
        assert_eq!(suppress_duplicates(faces.clone(), iou).len(), 2);
        assert_eq!(suppress_duplicates(faces, iou - 0.01).len(), 1);
    }

    #[test]
    fn test_degenerate_boxes_never_suppressed() {
        let faces = vec![face(10.0, 10.0, 0.0, 0.0, 1), face(10.0, 10.0, 0.0, 0.0, 2)];
        assert_eq!(suppress_duplicates(faces, DEFAULT_IOU_THRESHOLD).len(), 2);
    }

    #[test]
    fn test_non_finite_box_does_not_suppress() {
        let faces = vec![face(f32::NAN, 0.0, 40.0, 40.0, 1), face(0.0, 0.0, 40.0, 40.0, 2)];
        assert_eq!(ids(&suppress_duplicates(faces, DEFAULT_IOU_THRESHOLD)), vec![1, 2]);
    }

    #[test]
    fn test_empty() {
        assert!(suppress_duplicates(vec![], DEFAULT_IOU_THRESHOLD).is_empty());
    }
}
