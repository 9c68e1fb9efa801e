//! Frame sources.
//!
//! - `stub://<name>`: generated scene with a bright object that comes and goes
//! - `dir://<path>`: replay of a directory of stills (feature: ingest-image)
//!
//! Sources hand owned RGB8 frames to the pipeline and keep nothing after
//! the handoff.

#[cfg(feature = "ingest-image")]
pub mod image_dir;
pub mod synthetic;

use anyhow::{anyhow, Result};

use crate::frame::FrameSource;

#[cfg(feature = "ingest-image")]
pub use image_dir::ImageDirSource;
pub use synthetic::SyntheticSource;

/// Configuration shared by all sources.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    pub url: String,
    /// Target frame rate (frames per second).
    pub target_fps: u32,
    /// Frame width for generated scenes.
    pub width: u32,
    /// Frame height for generated scenes.
    pub height: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "stub://front_camera".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

/// Pick a source implementation from the URL scheme.
pub fn open_source(config: SourceConfig) -> Result<Box<dyn FrameSource>> {
    if config.url.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(config)));
    }
    if let Some(path) = config.url.strip_prefix("dir://") {
        #[cfg(feature = "ingest-image")]
        {
            return Ok(Box::new(ImageDirSource::new(path)));
        }
        #[cfg(not(feature = "ingest-image"))]
        {
            return Err(anyhow!(
                "directory source {} requires the ingest-image feature",
                path
            ));
        }
    }
    Err(anyhow!("unsupported source url: {}", config.url))
}
