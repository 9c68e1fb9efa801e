//! Cheap motion gate run before the (expensive) detector.
//!
//! Compares two equally sized samples at a fixed stride. A sampled pixel
//! counts as changed when the mean absolute difference of its three colour
//! channels exceeds `threshold`.

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

pub const DEFAULT_MOTION_THRESHOLD: u8 = 30;
pub const DEFAULT_MOTION_PIXEL_PERCENT: f32 = 1.0;
pub const DEFAULT_MOTION_SAMPLE_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MotionResult {
    pub changed: bool,
    /// Share of sampled pixels that changed, on a 0-100 scale.
    pub changed_percent: f32,
    pub changed_pixels: usize,
    pub sampled_pixels: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MotionFilter {
    /// Per-pixel mean channel difference that counts as change.
    pub threshold: u8,
    /// Percentage of sampled pixels that must change.
    pub pixel_percent: f32,
    /// Number of pixel positions sampled per comparison.
    pub sample_size: usize,
}

impl Default for MotionFilter {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MOTION_THRESHOLD,
            pixel_percent: DEFAULT_MOTION_PIXEL_PERCENT,
            sample_size: DEFAULT_MOTION_SAMPLE_SIZE,
        }
    }
}

impl MotionFilter {
    pub fn new(threshold: u8, pixel_percent: f32, sample_size: usize) -> Self {
        Self {
            threshold,
            pixel_percent,
            sample_size,
        }
    }

    /// Compare two samples.
    ///
    /// Missing samples or mismatched dimensions report no change with zero
    /// counts rather than an error.
    pub fn detect(&self, current: Option<&Frame>, previous: Option<&Frame>) -> MotionResult {
        let (Some(current), Some(previous)) = (current, previous) else {
            return MotionResult::default();
        };
        if !current.same_dimensions(previous) || current.is_empty() {
            return MotionResult::default();
        }

        let total = current.pixel_count();
        let stride = (total / self.sample_size.max(1)).max(1);

        let mut sampled = 0usize;
        let mut changed = 0usize;
        for index in (0..total).step_by(stride) {
            if sampled >= self.sample_size.max(1) {
                break;
            }
            sampled += 1;
            let a = current.pixel_at(index);
            let b = previous.pixel_at(index);
            let diff: u32 = a
                .iter()
                .zip(b.iter())
                .map(|(x, y)| (*x as i32 - *y as i32).unsigned_abs())
                .sum();
            if diff as f32 / 3.0 > self.threshold as f32 {
                changed += 1;
            }
        }

        let changed_percent = changed as f32 * 100.0 / sampled as f32;
        MotionResult {
            changed: changed_percent >= self.pixel_percent,
            changed_percent,
            changed_pixels: changed,
            sampled_pixels: sampled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::TileRect;

    #[test]
    fn identical_frames_report_no_change() {
        let filter = MotionFilter::default();
        let a = Frame::solid(64, 48, [40, 40, 40]);
        let result = filter.detect(Some(&a), Some(&a.clone()));
        assert!(!result.changed);
        assert_eq!(result.changed_pixels, 0);
        assert_eq!(result.sampled_pixels, 1000);
    }

    #[test]
    fn large_change_is_detected() {
        let filter = MotionFilter::default();
        let a = Frame::solid(64, 48, [0, 0, 0]);
        let mut b = a.clone();
        b.fill_rect(TileRect::new(0, 0, 32, 48), [200, 200, 200]);
        let result = filter.detect(Some(&b), Some(&a));
        assert!(result.changed);
        assert!(result.changed_percent > 40.0 && result.changed_percent < 60.0);
    }

    #[test]
    fn difference_at_threshold_does_not_count() {
        let filter = MotionFilter::new(30, 1.0, 100);
        let a = Frame::solid(10, 10, [0, 0, 0]);
        let b = Frame::solid(10, 10, [30, 30, 30]);
        assert!(!filter.detect(Some(&b), Some(&a)).changed);
        let c = Frame::solid(10, 10, [31, 31, 31]);
        let result = filter.detect(Some(&c), Some(&a));
        assert!(result.changed);
        assert_eq!(result.changed_percent, 100.0);
    }

    #[test]
    fn percent_equal_to_requirement_triggers() {
        // 100 pixels, stride 1, one changed pixel = exactly 1%.
        let filter = MotionFilter::new(10, 1.0, 100);
        let a = Frame::solid(10, 10, [0, 0, 0]);
        let mut b = a.clone();
        b.set_pixel(5, 5, [255, 255, 255]);
        let result = filter.detect(Some(&b), Some(&a));
        assert_eq!(result.changed_pixels, 1);
        assert!(result.changed);
    }

    #[test]
    fn missing_or_mismatched_samples_are_no_signal() {
        let filter = MotionFilter::default();
        let a = Frame::solid(10, 10, [0, 0, 0]);
        let b = Frame::solid(12, 10, [255, 255, 255]);
        assert_eq!(filter.detect(Some(&a), None), MotionResult::default());
        assert_eq!(filter.detect(None, Some(&a)), MotionResult::default());
        assert_eq!(filter.detect(Some(&a), Some(&b)), MotionResult::default());
    }
}
