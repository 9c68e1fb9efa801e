//! Greedy non-max suppression over frame-space detections.

use crate::detect::result::Detection;

/// Suppress lower-scored same-label boxes that overlap a kept box.
///
/// Candidates are stable-sorted by descending score, so equal scores keep
/// their input order and the output is deterministic for deterministic
/// input. A candidate is dropped when an already-kept box with the same
/// label has IoU strictly greater than `iou_threshold`; dropped boxes never
/// suppress anything. The result is ordered by descending score.
///
/// O(n^2) in the candidate count, which is bounded by label density times
/// the tile count rather than by resolution.
pub fn merge(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut candidates = detections;
    // `sort_by` is stable; `total_cmp` ranks NaN scores above every number.
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Detection> = Vec::with_capacity(candidates.len());
    'candidates: for candidate in candidates {
        for existing in &kept {
            if existing.label == candidate.label
                && existing.bbox.iou(&candidate.bbox) > iou_threshold
            {
                continue 'candidates;
            }
        }
        kept.push(candidate);
    }
    kept
}
