#![cfg(feature = "backend-tract")]

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use tract_onnx::prelude::*;

use crate::detect::backend::{DetectError, DetectorBackend};
use crate::detect::result::{Detection, COCO_CLASSES};
use crate::frame::Frame;
use crate::geometry::BoundingBox;

/// Box coordinates (cx, cy, w, h) precede the class scores in each anchor.
const CXYWH_OFFSET: usize = 4;
const LETTERBOX_FILL: u8 = 114;

/// Tract-based backend for YOLOv8-layout ONNX detectors.
///
/// Expects one input `[1, 3, S, S]` (RGB, 0..1) and one output
/// `[1, 4 + classes, anchors]`.
pub struct TractBackend {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_size: u32,
    class_names: Vec<String>,
}

impl TractBackend {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self, DetectError> {
        let model_path = model_path.as_ref();
        let side = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .map_err(|e| {
                DetectError::Model(format!("load {}: {}", model_path.display(), e))
            })?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, side, side)),
            )
            .map_err(|e| DetectError::Model(format!("set input fact: {}", e)))?
            .into_optimized()
            .map_err(|e| DetectError::Model(format!("optimize: {}", e)))?
            .into_runnable()
            .map_err(|e| DetectError::Model(format!("build runnable: {}", e)))?;

        Ok(Self {
            model,
            input_size,
            class_names: COCO_CLASSES.iter().map(|c| c.to_string()).collect(),
        })
    }

    /// Replace the COCO label table for custom models.
    pub fn with_class_names(mut self, names: Vec<String>) -> Self {
        self.class_names = names;
        self
    }

    /// Letterbox the frame into the model input; returns the tensor and scale.
    fn build_input(&self, frame: &Frame) -> Result<(Tensor, f32), DetectError> {
        let side = self.input_size;
        let (width, height) = (frame.width(), frame.height());
        if width == 0 || height == 0 {
            return Err(DetectError::Input("empty frame".into()));
        }
        let ratio = (side as f32 / width as f32).min(side as f32 / height as f32);
        let scaled_w = ((width as f32 * ratio).round() as u32).clamp(1, side);
        let scaled_h = ((height as f32 * ratio).round() as u32).clamp(1, side);
        let scaled = imageops::resize(frame.image(), scaled_w, scaled_h, FilterType::Triangle);
        let mut canvas = RgbImage::from_pixel(side, side, Rgb([LETTERBOX_FILL; 3]));
        imageops::replace(&mut canvas, &scaled, 0, 0);

        let side = side as usize;
        let input = tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            canvas.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
        });
        Ok((input.into_tensor(), ratio))
    }

    fn decode(
        &self,
        output: &Tensor,
        ratio: f32,
        frame: &Frame,
        confidence: f32,
    ) -> Result<Vec<Detection>, DetectError> {
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| DetectError::Inference(format!("output tensor was not f32: {}", e)))?;
        let preds = view
            .into_dimensionality::<tract_ndarray::Ix3>()
            .map_err(|e| DetectError::Inference(format!("unexpected output rank: {}", e)))?;
        let rows = preds.shape()[1];
        if rows <= CXYWH_OFFSET {
            return Err(DetectError::Inference(format!(
                "output has {} rows, expected box plus class scores",
                rows
            )));
        }

        let (frame_w, frame_h) = (frame.width() as f32, frame.height() as f32);
        let mut detections = Vec::new();
        let batch = preds.index_axis(tract_ndarray::Axis(0), 0);
        for anchor in batch.axis_iter(tract_ndarray::Axis(1)) {
            let Some((class_id, score)) = anchor
                .iter()
                .skip(CXYWH_OFFSET)
                .copied()
                .enumerate()
                .reduce(|best, x| if x.1 > best.1 { x } else { best })
            else {
                continue;
            };
            if score < confidence {
                continue;
            }

            let cx = anchor[0] / ratio;
            let cy = anchor[1] / ratio;
            let w = anchor[2] / ratio;
            let h = anchor[3] / ratio;
            let x1 = (cx - w / 2.0).clamp(0.0, frame_w);
            let y1 = (cy - h / 2.0).clamp(0.0, frame_h);
            let x2 = (cx + w / 2.0).clamp(0.0, frame_w);
            let y2 = (cy + h / 2.0).clamp(0.0, frame_h);
            let name = self
                .class_names
                .get(class_id)
                .map(String::as_str)
                .unwrap_or("unknown");
            detections.push(Detection::new(
                BoundingBox::from_corners(x1, y1, x2, y2),
                score,
                class_id as u32,
                name,
            ));
        }
        Ok(detections)
    }
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(
        &mut self,
        frame: &Frame,
        confidence: f32,
        overlap: f32,
    ) -> Result<Vec<Detection>, DetectError> {
        let (input, ratio) = self.build_input(frame)?;
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .map_err(|e| DetectError::Inference(e.to_string()))?;
        let output = outputs
            .first()
            .ok_or_else(|| DetectError::Inference("model produced no outputs".into()))?;
        let mut detections = self.decode(output, ratio, frame, confidence)?;
        crate::detect::non_max_suppression(&mut detections, overlap);
        Ok(detections)
    }

    fn warm_up(&mut self) -> Result<(), DetectError> {
        let side = self.input_size;
        let blank = Frame::new(RgbImage::new(side, side), 0);
        self.detect(&blank, 1.0, 0.5).map(|_| ())
    }
}
