use anyhow::Result;

use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// Opaque object scorer.
///
/// Given an image, a scorer returns raw candidate detections in that image's
/// own pixel coordinates. Latency and result ordering are unspecified; the
/// tiling detector owns filtering, coordinate remapping and merging.
pub trait Scorer: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Load the underlying model resource.
    ///
    /// Called at most once successfully. Fails when the model resource is
    /// unavailable.
    fn load(&mut self) -> Result<()>;

    /// Score an image.
    ///
    /// The image is borrowed for the duration of the call only.
    fn score(&mut self, image: &Frame) -> Result<Vec<RawDetection>>;
}
