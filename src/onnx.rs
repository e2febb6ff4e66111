//! Shared tract-onnx plumbing for the classifier and detector networks.

use ndarray::Array4;
use std::path::Path;
use tract_onnx::prelude::*;

use crate::error::PipelineError;

pub type OnnxPlan = TypedRunnableModel<TypedModel>;

/// Loads, optimizes and plans an ONNX network with a fixed f32 input shape.
pub fn load_plan(path: &Path, input_shape: [usize; 4]) -> Result<OnnxPlan, PipelineError> {
    tract_onnx::onnx()
        .model_for_path(path)
        .and_then(|model| model.with_input_fact(0, f32::fact(input_shape).into()))
        .and_then(|model| model.into_optimized())
        .and_then(|model| model.into_runnable())
        .map_err(|e| {
            PipelineError::Inference(format!("could not load model {}: {}", path.display(), e))
        })
}

/// Runs `plan` on a single input and returns the first output as a dynamic array.
pub fn run_single(
    plan: &OnnxPlan,
    input: Array4<f32>,
) -> Result<tract_ndarray::ArrayD<f32>, PipelineError> {
    let shape = input.shape().to_vec();
    let tensor = tract_ndarray::ArrayD::from_shape_vec(shape, input.into_raw_vec())
        .map_err(|e| PipelineError::Inference(e.to_string()))?
        .into_tensor();

    let outputs = plan
        .run(tvec!(tensor.into()))
        .map_err(|e| PipelineError::Inference(e.to_string()))?;
    let first = outputs
        .first()
        .ok_or_else(|| PipelineError::Inference("model produced no outputs".into()))?;
    let view = first
        .to_array_view::<f32>()
        .map_err(|e| PipelineError::Inference(e.to_string()))?;
    Ok(view.to_owned())
}
