mod backend;
pub mod backends;
mod config;
pub mod nms;
mod registry;
mod result;
mod tiling;

pub use backend::Scorer;
pub use backends::{BrightRegionScorer, ScorerProbe, ScriptedScorer};
pub use config::{
    DetectorConfig, SharedDetectorConfig, DEFAULT_CONFIDENCE_THRESHOLD,
    DEFAULT_NMS_IOU_THRESHOLD, DEFAULT_TARGET_LABEL, DEFAULT_TILE_OVERLAP,
};
pub use registry::ScorerRegistry;
pub use result::{Detection, RawDetection};
pub use tiling::{tile_layout, zoom_crop, TilingDetector};

#[cfg(feature = "backend-tract")]
pub use backends::TractScorer;
