//! Fracture classifier adapter.
//!
//! The network answers "is this X-ray free of fractures?". The adapter hides the
//! network's input layout and flips its score so that callers always receive
//! P(fracture).

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;
use std::path::Path;
use std::sync::Arc;

use crate::error::PipelineError;
use crate::imaging;
use crate::models::Classification;
use crate::onnx::{self, OnnxPlan};

pub const CLASSIFIER_INPUT_SIZE: u32 = 224;

/// Raw network behind the adapter.
pub trait ClassifierModel: Send + Sync {
    /// P(no fracture) for one decoded image.
    fn predict_raw(&self, image: &DynamicImage) -> Result<f32, PipelineError>;
}

impl<M: ClassifierModel + ?Sized> ClassifierModel for Arc<M> {
    fn predict_raw(&self, image: &DynamicImage) -> Result<f32, PipelineError> {
        (**self).predict_raw(image)
    }
}

pub trait Classifier: Send + Sync {
    fn classify(&self, image_bytes: &[u8]) -> Result<Classification, PipelineError>;
}

#[derive(Debug)]
pub struct FractureClassifier<M> {
    model: M,
}

impl<M: ClassifierModel> FractureClassifier<M> {
    pub fn new(model: M) -> Self {
        Self { model }
    }
}

impl<M: ClassifierModel> Classifier for FractureClassifier<M> {
    fn classify(&self, image_bytes: &[u8]) -> Result<Classification, PipelineError> {
        let image = imaging::decode(image_bytes)?;
        let raw = self.model.predict_raw(&image)?;
        if !raw.is_finite() || !(0.0..=1.0).contains(&raw) {
            return Err(PipelineError::Inference(format!(
                "classifier score {} is not a probability",
                raw
            )));
        }

        let classification = Classification::from_raw(f64::from(raw));
        tracing::info!(
            raw = classification.raw_score,
            prediction = classification.fracture_probability,
            "classified image"
        );
        Ok(classification)
    }
}

/// ONNX export of the fracture classifier: NHWC, RGB, scaled to [0, 1], single
/// sigmoid output at `[0][0]`.
pub struct OnnxClassifier {
    plan: OnnxPlan,
}

impl OnnxClassifier {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let size = CLASSIFIER_INPUT_SIZE as usize;
        let plan = onnx::load_plan(path.as_ref(), [1, size, size, 3])?;
        tracing::info!(path = %path.as_ref().display(), "loaded classifier model");
        Ok(Self { plan })
    }
}

impl ClassifierModel for OnnxClassifier {
    fn predict_raw(&self, image: &DynamicImage) -> Result<f32, PipelineError> {
        let input = to_input_tensor(image);
        let output = onnx::run_single(&self.plan, input)?;
        output
            .iter()
            .next()
            .copied()
            .ok_or_else(|| PipelineError::Inference("classifier returned an empty tensor".into()))
    }
}

/// Stretches to 224x224 RGB and lays pixels out as `[1, H, W, C]` in [0, 1].
fn to_input_tensor(image: &DynamicImage) -> Array4<f32> {
    let size = CLASSIFIER_INPUT_SIZE;
    let rgb = image
        .resize_exact(size, size, FilterType::Triangle)
        .to_rgb8();

    let mut input = Array4::zeros((1, size as usize, size as usize, 3));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            input[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 255.0;
        }
    }
    input
}
