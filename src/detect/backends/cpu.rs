use anyhow::Result;

use crate::detect::backend::Scorer;
use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// CPU heuristic scorer: reports the bright region of an image as one object.
///
/// Pairs with the synthetic frame source, whose "object" is a bright block
/// on a dark background. Score is `0.5 + fill / 2` where `fill` is the share
/// of the bounding box covered by bright pixels.
pub struct BrightRegionScorer {
    label: String,
    luma_threshold: u8,
    min_pixels: usize,
}

impl BrightRegionScorer {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            luma_threshold: 200,
            min_pixels: 16,
        }
    }

    pub fn with_luma_threshold(mut self, threshold: u8) -> Self {
        self.luma_threshold = threshold;
        self
    }

    pub fn with_min_pixels(mut self, min_pixels: usize) -> Self {
        self.min_pixels = min_pixels;
        self
    }
}

impl Default for BrightRegionScorer {
    fn default() -> Self {
        Self::new("person")
    }
}

fn luma(rgb: [u8; 3]) -> u8 {
    ((rgb[0] as u32 * 299 + rgb[1] as u32 * 587 + rgb[2] as u32 * 114) / 1000) as u8
}

impl Scorer for BrightRegionScorer {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn load(&mut self) -> Result<()> {
        Ok(())
    }

    fn score(&mut self, image: &Frame) -> Result<Vec<RawDetection>> {
        let mut count = 0usize;
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);

        for y in 0..image.height() {
            for x in 0..image.width() {
                if luma(image.pixel(x, y)) >= self.luma_threshold {
                    count += 1;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        if count < self.min_pixels.max(1) {
            return Ok(Vec::new());
        }

        let width = (max_x - min_x + 1) as f32;
        let height = (max_y - min_y + 1) as f32;
        let fill = count as f32 / (width * height);
        Ok(vec![RawDetection::new(
            self.label.clone(),
            (0.5 + fill / 2.0).min(1.0),
            [min_x as f32, min_y as f32, width, height],
        )])
    }
}
