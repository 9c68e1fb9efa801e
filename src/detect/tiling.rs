//! Tiled detection over a (optionally zoom-cropped) frame.
//!
//! Small objects are easier for a scorer to find when it sees a fraction of
//! the frame at native resolution, so the working frame is split into a
//! `grid x grid` layout of overlapping tiles. Each tile is scored on its own,
//! boxes are remapped into original-frame coordinates, and duplicates from
//! the overlap bands are merged with NMS.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::detect::backend::Scorer;
use crate::detect::config::{DetectorConfig, SharedDetectorConfig};
use crate::detect::nms;
use crate::detect::result::{Detection, RawDetection};
use crate::error::RecorderError;
use crate::frame::Frame;
use crate::geometry::{BoundingBox, TileRect};

/// Centered crop of `(width / zoom, height / zoom)`.
///
/// Zoom factors below 1 (or non-finite) select the full frame.
pub fn zoom_crop(width: u32, height: u32, zoom: f32) -> TileRect {
    if !zoom.is_finite() || zoom <= 1.0 || width == 0 || height == 0 {
        return TileRect::full(width, height);
    }
    let z = zoom as f64;
    let crop_w = ((width as f64 / z).floor() as u32).clamp(1, width);
    let crop_h = ((height as f64 / z).floor() as u32).clamp(1, height);
    TileRect::new((width - crop_w) / 2, (height - crop_h) / 2, crop_w, crop_h)
}

/// Tile origins and sizes for a `grid x grid` scan with fractional overlap.
///
/// Tile width is `ceil(W / (grid - (grid - 1) * overlap))` and the step is
/// `floor(tw * (1 - overlap))`. Origins are clamped to `W - tw` so the last
/// column never leaves the frame even when `step * grid` overshoots; rows
/// follow the same rule. Tiles are returned row-major.
pub fn tile_layout(width: u32, height: u32, grid: u32, overlap: f32) -> Vec<TileRect> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    if grid <= 1 {
        return vec![TileRect::full(width, height)];
    }
    let overlap = if overlap.is_finite() {
        overlap.clamp(0.0, 1.0) as f64
    } else {
        0.0
    };
    let (tile_w, step_x) = tile_span(width, grid, overlap);
    let (tile_h, step_y) = tile_span(height, grid, overlap);

    let mut tiles = Vec::with_capacity((grid * grid) as usize);
    for row in 0..grid {
        for col in 0..grid {
            let x = (col as u64 * step_x as u64).min((width - tile_w) as u64) as u32;
            let y = (row as u64 * step_y as u64).min((height - tile_h) as u64) as u32;
            tiles.push(TileRect::new(x, y, tile_w, tile_h));
        }
    }
    tiles
}

fn tile_span(extent: u32, grid: u32, overlap: f64) -> (u32, u32) {
    let divisor = grid as f64 - (grid as f64 - 1.0) * overlap;
    let tile = ((extent as f64 / divisor).ceil() as u32).clamp(1, extent);
    let step = (tile as f64 * (1.0 - overlap)).floor() as u32;
    (tile, step)
}

/// Detector that drives a `Scorer` over a tiled frame.
pub struct TilingDetector {
    scorer: Mutex<Box<dyn Scorer>>,
    ready: AtomicBool,
    config: SharedDetectorConfig,
}

impl TilingDetector {
    pub fn new(scorer: Box<dyn Scorer>, config: SharedDetectorConfig) -> Self {
        Self {
            scorer: Mutex::new(scorer),
            ready: AtomicBool::new(false),
            config,
        }
    }

    pub fn config(&self) -> &SharedDetectorConfig {
        &self.config
    }

    pub fn scorer_name(&self) -> String {
        self.lock_scorer().name().to_string()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Load the scorer once.
    ///
    /// Concurrent callers block on the in-flight load and observe its
    /// outcome; once loaded, further calls return immediately. A failed
    /// load leaves the detector unloaded so a later call can retry.
    pub fn load(&self) -> Result<(), RecorderError> {
        if self.is_ready() {
            return Ok(());
        }
        let mut scorer = self.lock_scorer();
        if self.is_ready() {
            return Ok(());
        }
        scorer.load().map_err(|e| {
            RecorderError::NotReady(format!("scorer {} failed to load: {:#}", scorer.name(), e))
        })?;
        self.ready.store(true, Ordering::Release);
        log::info!("scorer {} loaded", scorer.name());
        Ok(())
    }

    /// Takes effect on the next scorer call.
    pub fn set_sensitivity(&self, threshold: f32) {
        self.config.set_sensitivity(threshold);
    }

    /// Run one detection cycle over `frame`.
    ///
    /// Tiles are scanned strictly one after another, yielding the thread
    /// between tiles. Any scorer failure fails the whole call; partial
    /// results are discarded so a half-finished scan cannot under-report.
    pub fn detect(&self, frame: &Frame) -> Result<Vec<Detection>, RecorderError> {
        if !self.is_ready() {
            return Err(RecorderError::NotReady(
                "detect called before scorer load".to_string(),
            ));
        }
        if frame.is_empty() {
            return Ok(Vec::new());
        }

        let crop = zoom_crop(frame.width(), frame.height(), self.config.read().zoom);
        let cropped;
        let working = if crop == TileRect::full(frame.width(), frame.height()) {
            frame
        } else {
            cropped = frame.region(crop);
            &cropped
        };

        let (grid, overlap) = {
            let cfg = self.config.read();
            (cfg.tile_grid, cfg.tile_overlap)
        };

        if grid <= 1 {
            let whole = TileRect::full(working.width(), working.height());
            return self.score_region(working, whole, crop);
        }

        let tiles = tile_layout(working.width(), working.height(), grid, overlap);
        let mut candidates = Vec::new();
        for (index, tile) in tiles.iter().enumerate() {
            if index > 0 {
                std::thread::yield_now();
            }
            let image = working.region(*tile);
            candidates.extend(self.score_region(&image, *tile, crop)?);
        }

        let before = candidates.len();
        let merged = nms::merge(candidates, self.config.read().nms_iou_threshold);
        log::debug!(
            "tiled scan: {} tiles, {} candidates, {} after nms",
            tiles.len(),
            before,
            merged.len()
        );
        Ok(merged)
    }

    /// Score one region image and map its boxes back to frame coordinates.
    ///
    /// `region` locates `image` inside the working frame; `crop` locates the
    /// working frame inside the original frame.
    fn score_region(
        &self,
        image: &Frame,
        region: TileRect,
        crop: TileRect,
    ) -> Result<Vec<Detection>, RecorderError> {
        let raw = {
            let mut scorer = self.lock_scorer();
            scorer.score(image).map_err(|e| {
                RecorderError::Scorer(format!("{} failed on {:?}: {:#}", scorer.name(), region, e))
            })?
        };
        let cfg = self.config.read();
        Ok(raw
            .into_iter()
            .filter_map(|candidate| remap(candidate, &cfg, image, region, crop))
            .collect())
    }

    /// A scorer that panicked mid-call poisons the lock; the next cycle
    /// takes it over rather than failing forever.
    fn lock_scorer(&self) -> MutexGuard<'_, Box<dyn Scorer>> {
        self.scorer.lock().unwrap_or_else(|poisoned| {
            log::warn!("scorer panicked during a previous cycle; reusing it");
            self.scorer.clear_poison();
            poisoned.into_inner()
        })
    }
}

fn remap(
    candidate: RawDetection,
    cfg: &DetectorConfig,
    image: &Frame,
    region: TileRect,
    crop: TileRect,
) -> Option<Detection> {
    if !cfg.accepts(&candidate.label, candidate.score) {
        return None;
    }
    let bbox = BoundingBox::from_xywh(candidate.bbox)
        .clamp_to(image.width() as f32, image.height() as f32)
        .offset((region.x + crop.x) as f32, (region.y + crop.y) as f32);
    Some(Detection::new(candidate.label, candidate.score, bbox))
}
