//! Presence Recorder
//!
//! On-device pipeline that turns a live video feed into confidence-scored
//! detections and records clips while a target object class stays in view.
//!
//! # Architecture
//!
//! frame -> (optional) motion gate -> tiling detector -> recorder
//!
//! 1. **Tiled detection**: frames are split into overlapping tiles, each tile
//!    is scored by an opaque `Scorer`, boxes are remapped into frame space
//!    and duplicates merged with NMS.
//! 2. **Recording**: a state machine starts capture after two consecutive
//!    positive cycles and stops it once the object has been absent for the
//!    grace period, or on a manual stop.
//! 3. **Single slot**: at most one detection cycle is in flight; ticks that
//!    arrive while it runs are dropped.
//!
//! # Module Structure
//!
//! - `geometry`: boxes, IoU, tile rectangles
//! - `frame`: RGB8 frame buffer and the `FrameSource` contract
//! - `ingest`: frame sources (synthetic, image directory)
//! - `detect`: scorer backends, tiling detector, NMS
//! - `motion`: cheap pre-filter
//! - `capture`: capture device contract and in-process spool device
//! - `storage`: clip persistence (sqlite, in-memory)
//! - `recorder`: recording state machine
//! - `pipeline`: cycle scheduler tying it together
//! - `config`: daemon configuration

pub mod capture;
pub mod config;
pub mod detect;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod ingest;
pub mod motion;
pub mod pipeline;
pub mod recorder;
pub mod storage;

pub use capture::{
    CaptureBlob, CaptureDevice, CaptureHandle, CaptureOptions, SpoolCapture, SPOOL_MIME_TYPE,
};
pub use config::{RecorderdConfig, ScorerSettings, SourceSettings};
pub use detect::{
    nms, tile_layout, zoom_crop, BrightRegionScorer, Detection, DetectorConfig, RawDetection,
    Scorer, ScorerRegistry, ScriptedScorer, SharedDetectorConfig, TilingDetector,
};
pub use error::RecorderError;
pub use frame::{Frame, FrameSource, SourceStats};
pub use geometry::{BoundingBox, TileRect};
pub use ingest::{open_source, SourceConfig, SyntheticSource};
pub use motion::{MotionFilter, MotionResult};
pub use pipeline::{CycleOutcome, DetectionWorker, Pipeline, PipelineStats};
pub use recorder::{
    Recorder, RecorderEvent, RecorderSettings, RecorderState, RecordingSession, StopReason,
};
pub use storage::{
    Clip, ClipId, ClipStats, ClipStore, ClipSummary, InMemoryClipStore, SqliteClipStore,
};

#[cfg(feature = "backend-tract")]
pub use detect::TractScorer;
#[cfg(feature = "ingest-image")]
pub use ingest::ImageDirSource;
