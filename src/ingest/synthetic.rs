//! Generated scene for `stub://` URLs.
//!
//! A dim, slightly noisy background with a bright block that walks across
//! the frame for part of every scene period. Output is deterministic for a
//! given seed, so end-to-end runs are repeatable.

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::SourceConfig;
use crate::frame::{Frame, FrameSource, SourceStats};
use crate::geometry::TileRect;

const BACKGROUND: u8 = 40;
const NOISE: i16 = 4;
const OBJECT_RGB: [u8; 3] = [240, 240, 230];
const DEFAULT_SEED: u64 = 0x5eed;

/// Frames per scene period.
pub const SCENE_PERIOD: u64 = 120;
/// Frames of each period (from its start) with the object in view.
pub const OBJECT_VISIBLE_FRAMES: u64 = 60;

pub struct SyntheticSource {
    config: SourceConfig,
    frame_count: u64,
    rng: StdRng,
    connected: bool,
}

impl SyntheticSource {
    pub fn new(config: SourceConfig) -> Self {
        Self::with_seed(config, DEFAULT_SEED)
    }

    pub fn with_seed(config: SourceConfig, seed: u64) -> Self {
        Self {
            config,
            frame_count: 0,
            rng: StdRng::seed_from_u64(seed),
            connected: false,
        }
    }

    /// Where the object is drawn in frame `index`, if it is in view.
    pub fn object_rect(&self, index: u64) -> Option<TileRect> {
        let phase = index % SCENE_PERIOD;
        if phase >= OBJECT_VISIBLE_FRAMES {
            return None;
        }
        let (width, height) = (self.config.width, self.config.height);
        let block_w = (width / 8).max(1);
        let block_h = (height / 4).max(1);
        let travel = width.saturating_sub(block_w) as u64;
        let x = (travel * phase / OBJECT_VISIBLE_FRAMES.max(1)) as u32;
        let y = (height - block_h) / 2;
        Some(TileRect::new(x, y, block_w, block_h))
    }

    fn render(&mut self, index: u64) -> Frame {
        let mut frame = Frame::solid(self.config.width, self.config.height, [BACKGROUND; 3]);
        for y in 0..frame.height() {
            for x in 0..frame.width() {
                let jitter = self.rng.gen_range(-NOISE..=NOISE);
                let value = (BACKGROUND as i16 + jitter).clamp(0, 255) as u8;
                frame.set_pixel(x, y, [value; 3]);
            }
        }
        if let Some(rect) = self.object_rect(index) {
            frame.fill_rect(rect, OBJECT_RGB);
        }
        frame
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to {}", self.config.url);
        self.connected = true;
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let index = self.frame_count;
        self.frame_count += 1;
        Ok(self.render(index))
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            url: self.config.url.clone(),
        }
    }
}
