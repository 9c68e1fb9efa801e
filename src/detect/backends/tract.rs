#![cfg(feature = "backend-tract")]

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tract_onnx::prelude::*;

use crate::detect::backend::Scorer;
use crate::detect::result::RawDetection;
use crate::frame::Frame;
use crate::geometry::TileRect;

type Plan = TypedRunnableModel<TypedModel>;

/// Tract-based scorer for YOLO-style ONNX exports.
///
/// The model is read from a local file on `load`. Each scored image is
/// resampled to the model input size; output rows of
/// `[cx, cy, w, h, class scores...]` are decoded and scaled back into the
/// scored image's pixel coordinates. Both `[1, rows, 4 + classes]` and the
/// transposed `[1, 4 + classes, rows]` layouts are accepted.
pub struct TractScorer {
    model_path: PathBuf,
    input_width: u32,
    input_height: u32,
    class_names: Vec<String>,
    min_score: f32,
    model: Option<Plan>,
}

impl TractScorer {
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_width: u32,
        input_height: u32,
        class_names: Vec<String>,
    ) -> Self {
        Self {
            model_path: model_path.as_ref().to_path_buf(),
            input_width,
            input_height,
            class_names,
            min_score: 0.05,
            model: None,
        }
    }

    /// Candidates below this score are dropped before they reach the detector.
    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    fn build_input(&self, image: &Frame) -> Tensor {
        let resized = image.render_into(
            TileRect::full(image.width(), image.height()),
            self.input_width,
            self.input_height,
        );
        let width = self.input_width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.input_height as usize, width),
            |(_, channel, y, x)| resized.pixel_at(y * width + x)[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, image: &Frame) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 {
            return Err(anyhow!("unexpected output rank {:?}", shape));
        }
        let features = 4 + self.class_names.len();
        let (rows, transposed) = if shape[2] == features {
            (shape[1], false)
        } else if shape[1] == features {
            (shape[2], true)
        } else {
            return Err(anyhow!(
                "output shape {:?} does not match {} classes",
                shape,
                self.class_names.len()
            ));
        };
        let at = |row: usize, feature: usize| -> f32 {
            if transposed {
                view[[0, feature, row]]
            } else {
                view[[0, row, feature]]
            }
        };

        let scale_x = image.width() as f32 / self.input_width as f32;
        let scale_y = image.height() as f32 / self.input_height as f32;
        let mut out = Vec::new();
        for row in 0..rows {
            let (mut best_class, mut best_score) = (0usize, f32::NEG_INFINITY);
            for class in 0..self.class_names.len() {
                let score = at(row, 4 + class);
                if score > best_score {
                    best_class = class;
                    best_score = score;
                }
            }
            if !best_score.is_finite() || best_score < self.min_score {
                continue;
            }
            let (cx, cy, w, h) = (at(row, 0), at(row, 1), at(row, 2), at(row, 3));
            if !(cx.is_finite() && cy.is_finite() && w > 0.0 && h > 0.0) {
                continue;
            }
            out.push(RawDetection::new(
                self.class_names[best_class].clone(),
                best_score.min(1.0),
                [
                    (cx - w / 2.0) * scale_x,
                    (cy - h / 2.0) * scale_y,
                    w * scale_x,
                    h * scale_y,
                ],
            ));
        }
        Ok(out)
    }
}

impl Scorer for TractScorer {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn load(&mut self) -> Result<()> {
        let model = tract_onnx::onnx()
            .model_for_path(&self.model_path)
            .with_context(|| {
                format!(
                    "failed to load ONNX model from {}",
                    self.model_path.display()
                )
            })?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, self.input_height as usize, self.input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;
        self.model = Some(model);
        Ok(())
    }

    fn score(&mut self, image: &Frame) -> Result<Vec<RawDetection>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| anyhow!("tract scorer used before load"))?;
        if image.is_empty() {
            return Ok(Vec::new());
        }
        let input = self.build_input(image);
        let outputs = model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, image)
    }
}
