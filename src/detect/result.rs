use serde::{Deserialize, Serialize};

use crate::geometry::BoundingBox;

/// Candidate returned by a scorer, in the scored image's coordinates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    pub label: String,
    pub score: f32,
    /// `[x, y, width, height]`
    pub bbox: [f32; 4],
}

impl RawDetection {
    pub fn new(label: impl Into<String>, score: f32, bbox: [f32; 4]) -> Self {
        Self {
            label: label.into(),
            score,
            bbox,
        }
    }
}

/// Detection in source-frame pixel coordinates.
///
/// Produced fresh per detection cycle and never mutated afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    /// Confidence in `[0, 1]`.
    pub score: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: impl Into<String>, score: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.into(),
            score,
            bbox,
        }
    }
}
