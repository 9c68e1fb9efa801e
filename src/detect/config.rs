use std::collections::BTreeSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_TARGET_LABEL: &str = "person";
pub const DEFAULT_TILE_OVERLAP: f32 = 0.2;
pub const DEFAULT_NMS_IOU_THRESHOLD: f32 = 0.5;

/// Detector tuning. Mutable between (and during) cycles.
///
/// `tile_grid <= 1` disables tiling and runs a single full-frame pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    pub target_labels: BTreeSet<String>,
    pub tile_grid: u32,
    /// Fraction of a tile shared with its neighbour, in `[0, 1)`.
    pub tile_overlap: f32,
    pub nms_iou_threshold: f32,
    /// Software zoom factor. Values below 1 behave as 1.
    pub zoom: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            target_labels: BTreeSet::from([DEFAULT_TARGET_LABEL.to_string()]),
            tile_grid: 1,
            tile_overlap: DEFAULT_TILE_OVERLAP,
            nms_iou_threshold: DEFAULT_NMS_IOU_THRESHOLD,
            zoom: 1.0,
        }
    }
}

impl DetectorConfig {
    /// True when the candidate passes both the label and confidence filters.
    pub fn accepts(&self, label: &str, score: f32) -> bool {
        score >= self.confidence_threshold && self.target_labels.contains(label)
    }
}

/// Shared, live detector configuration.
///
/// Reads are not snapshotted: a running cycle re-reads the configuration at
/// each use, so a change may take effect part-way through a tiled scan.
/// Cycles are independent, so the next cycle always sees a consistent view.
#[derive(Clone, Debug, Default)]
pub struct SharedDetectorConfig {
    inner: Arc<RwLock<DetectorConfig>>,
}

impl SharedDetectorConfig {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, DetectorConfig> {
        // A writer panicking mid-update leaves plain data behind; keep serving it.
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, DetectorConfig> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Any float is accepted; out-of-range values simply filter nothing or everything.
    pub fn set_sensitivity(&self, threshold: f32) {
        self.write().confidence_threshold = threshold;
    }

    pub fn set_tile_grid(&self, grid: u32) {
        self.write().tile_grid = grid;
    }

    pub fn set_tile_overlap(&self, overlap: f32) {
        self.write().tile_overlap = overlap;
    }

    pub fn set_zoom(&self, zoom: f32) {
        self.write().zoom = zoom;
    }

    pub fn set_target_labels<I, S>(&self, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.write().target_labels = labels.into_iter().map(Into::into).collect();
    }
}
