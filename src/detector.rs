//! Fracture region detector adapter.
//!
//! The detector runtime consumes files, so every call writes the upload to a uniquely
//! named transient file that is removed when the call returns, whichever way it returns.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use ndarray::Array4;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tract_onnx::prelude::tract_ndarray::Ix3;

use crate::error::PipelineError;
use crate::imaging;
use crate::models::BoundingBox;
use crate::onnx::{self, OnnxPlan};

/// Minimum score for a detection to be reported. Fixed policy, not configurable.
pub const DETECTION_CONFIDENCE: f32 = 0.25;

pub const DETECTOR_INPUT_SIZE: u32 = 640;
const NMS_IOU: f64 = 0.7;
const LETTERBOX_FILL: u8 = 114;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
}

/// Object-detector runtime that reads its input image from disk.
pub trait DetectionRuntime: Send + Sync {
    fn detect_file(
        &self,
        path: &Path,
        min_confidence: f32,
    ) -> Result<Vec<RawDetection>, PipelineError>;
}

impl<R: DetectionRuntime + ?Sized> DetectionRuntime for Arc<R> {
    fn detect_file(
        &self,
        path: &Path,
        min_confidence: f32,
    ) -> Result<Vec<RawDetection>, PipelineError> {
        (**self).detect_file(path, min_confidence)
    }
}

pub trait Detector: Send + Sync {
    /// Boxes scoring at least [`DETECTION_CONFIDENCE`], in detector emission order.
    fn detect(&self, image_bytes: &[u8]) -> Result<Vec<BoundingBox>, PipelineError>;
}

#[derive(Debug)]
pub struct RegionDetector<R> {
    runtime: R,
    scratch_dir: PathBuf,
}

impl<R: DetectionRuntime> RegionDetector<R> {
    pub fn new(runtime: R, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            runtime,
            scratch_dir: scratch_dir.into(),
        }
    }
}

impl<R: DetectionRuntime> Detector for RegionDetector<R> {
    fn detect(&self, image_bytes: &[u8]) -> Result<Vec<BoundingBox>, PipelineError> {
        fs::create_dir_all(&self.scratch_dir)?;

        let suffix = format!(".{}", imaging::extension_for(image_bytes));
        let mut transient = tempfile::Builder::new()
            .prefix("xray-")
            .suffix(&suffix)
            .tempfile_in(&self.scratch_dir)?;
        transient.write_all(image_bytes)?;
        transient.flush()?;

        let detections = self
            .runtime
            .detect_file(transient.path(), DETECTION_CONFIDENCE)?;

        let boxes: Vec<BoundingBox> = detections
            .into_iter()
            .filter(|d| d.confidence >= DETECTION_CONFIDENCE)
            .map(|d| d.bbox)
            .collect();
        tracing::debug!(boxes = boxes.len(), "detected regions");
        Ok(boxes)
    }
}

/// YOLO-style ONNX detector: `[1, 3, 640, 640]` letterboxed input, `[1, 4 + classes, anchors]`
/// output with centre/size boxes followed by per-class scores.
pub struct OnnxYoloDetector {
    plan: OnnxPlan,
}

impl OnnxYoloDetector {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let size = DETECTOR_INPUT_SIZE as usize;
        let plan = onnx::load_plan(path.as_ref(), [1, 3, size, size])?;
        tracing::info!(path = %path.as_ref().display(), "loaded detector model");
        Ok(Self { plan })
    }
}

impl DetectionRuntime for OnnxYoloDetector {
    fn detect_file(
        &self,
        path: &Path,
        min_confidence: f32,
    ) -> Result<Vec<RawDetection>, PipelineError> {
        let image = image::io::Reader::open(path)?
            .with_guessed_format()?
            .decode()
            .map_err(|e| PipelineError::Decode(e.to_string()))?;

        let (input, letterbox) = Letterbox::apply(&image, DETECTOR_INPUT_SIZE);
        let output = onnx::run_single(&self.plan, input)?;
        let output = output
            .into_dimensionality::<Ix3>()
            .map_err(|e| PipelineError::Inference(format!("unexpected detector output: {}", e)))?;

        let (_, rows, anchors) = output.dim();
        if rows < 5 {
            return Err(PipelineError::Inference(format!(
                "detector output has {} rows, expected at least 5",
                rows
            )));
        }

        let mut candidates = Vec::new();
        for i in 0..anchors {
            let score = (4..rows)
                .map(|k| output[[0, k, i]])
                .fold(f32::NEG_INFINITY, f32::max);
            if score < min_confidence {
                continue;
            }
            let (cx, cy, w, h) = (
                output[[0, 0, i]] as f64,
                output[[0, 1, i]] as f64,
                output[[0, 2, i]] as f64,
                output[[0, 3, i]] as f64,
            );
            candidates.push(RawDetection {
                bbox: letterbox.restore(BoundingBox::new(
                    cx - w / 2.0,
                    cy - h / 2.0,
                    cx + w / 2.0,
                    cy + h / 2.0,
                )),
                confidence: score,
            });
        }

        Ok(non_max_suppression(candidates, NMS_IOU))
    }
}

/// Aspect-preserving resize onto a square grey canvas, plus the inverse mapping.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale_x: f64,
    scale_y: f64,
    pad_x: f64,
    pad_y: f64,
    width: f64,
    height: f64,
}

impl Letterbox {
    fn apply(image: &DynamicImage, size: u32) -> (Array4<f32>, Letterbox) {
        let (width, height) = image.dimensions();
        let (new_width, new_height) = if width > height {
            (size, ((size * height) / width).max(1))
        } else {
            (((size * width) / height).max(1), size)
        };
        let resized = image
            .resize_exact(new_width, new_height, FilterType::Triangle)
            .to_rgb8();

        let pad_x = (size - new_width) / 2;
        let pad_y = (size - new_height) / 2;
        let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
        image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

        let mut input = Array4::zeros((1, 3, size as usize, size as usize));
        for (x, y, pixel) in canvas.enumerate_pixels() {
            for c in 0..3 {
                input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
            }
        }

        let letterbox = Letterbox {
            scale_x: new_width as f64 / width as f64,
            scale_y: new_height as f64 / height as f64,
            pad_x: pad_x as f64,
            pad_y: pad_y as f64,
            width: width as f64,
            height: height as f64,
        };
        (input, letterbox)
    }

    fn restore(&self, b: BoundingBox) -> BoundingBox {
        let x = |v: f64| ((v - self.pad_x) / self.scale_x).clamp(0.0, self.width);
        let y = |v: f64| ((v - self.pad_y) / self.scale_y).clamp(0.0, self.height);
        BoundingBox::new(x(b.x1), y(b.y1), x(b.x2), y(b.y2))
    }
}

/// Greedy class-agnostic NMS; survivors come out by descending confidence.
fn non_max_suppression(mut candidates: Vec<RawDetection>, iou_threshold: f64) -> Vec<RawDetection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<RawDetection> = Vec::new();
    for candidate in candidates {
        if kept
            .iter()
            .all(|k| k.bbox.iou(&candidate.bbox) <= iou_threshold)
        {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedRuntime {
        result: Result<Vec<RawDetection>, String>,
        seen: Mutex<Vec<(PathBuf, bool, f32)>>,
    }

    impl ScriptedRuntime {
        fn returning(result: Result<Vec<RawDetection>, String>) -> Self {
            Self {
                result,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl DetectionRuntime for ScriptedRuntime {
        fn detect_file(
            &self,
            path: &Path,
            min_confidence: f32,
        ) -> Result<Vec<RawDetection>, PipelineError> {
            self.seen
                .lock()
                .unwrap()
                .push((path.to_path_buf(), path.exists(), min_confidence));
            self.result.clone().map_err(PipelineError::Inference)
        }
    }

    fn det(x1: f64, confidence: f32) -> RawDetection {
        RawDetection {
            bbox: BoundingBox::new(x1, 10.0, x1 + 50.0, 60.0),
            confidence,
        }
    }

    fn scratch_entries(dir: &Path) -> usize {
        fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
    }

    #[test]
    fn keeps_detections_at_or_above_threshold_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = ScriptedRuntime::returning(Ok(vec![
            det(0.0, 0.9),
            det(100.0, 0.1),
            det(200.0, 0.25),
        ]));
        let detector = RegionDetector::new(runtime, dir.path().join("scratch"));

        let boxes = detector.detect(b"bytes").unwrap();
        assert_eq!(boxes, vec![det(0.0, 0.9).bbox, det(200.0, 0.25).bbox]);

        let seen = detector.runtime.seen.lock().unwrap();
        let (path, existed, min_confidence) = &seen[0];
        assert!(*existed);
        assert_eq!(*min_confidence, DETECTION_CONFIDENCE);
        assert!(!path.exists());
    }

    #[test]
    fn empty_result_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let detector = RegionDetector::new(ScriptedRuntime::returning(Ok(Vec::new())), dir.path());
        assert!(detector.detect(b"bytes").unwrap().is_empty());
        assert_eq!(scratch_entries(dir.path()), 0);
    }

    #[test]
    fn transient_file_is_removed_when_runtime_fails() {
        let dir = tempfile::tempdir().unwrap();
        let detector = RegionDetector::new(
            ScriptedRuntime::returning(Err("cuda out of memory".into())),
            dir.path(),
        );

        let err = detector.detect(b"bytes").unwrap_err();
        assert!(matches!(err, PipelineError::Inference(msg) if msg == "cuda out of memory"));
        assert_eq!(scratch_entries(dir.path()), 0);
    }

    #[test]
    fn concurrent_calls_use_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let detector = RegionDetector::new(ScriptedRuntime::returning(Ok(Vec::new())), dir.path());
        detector.detect(b"same bytes").unwrap();
        detector.detect(b"same bytes").unwrap();

        let seen = detector.runtime.seen.lock().unwrap();
        assert_ne!(seen[0].0, seen[1].0);
    }

    #[test]
    fn nms_drops_overlapping_lower_scores() {
        let kept = non_max_suppression(
            vec![det(0.0, 0.5), det(2.0, 0.8), det(300.0, 0.4)],
            NMS_IOU,
        );
        assert_eq!(kept, vec![det(2.0, 0.8), det(300.0, 0.4)]);
    }

    #[test]
    fn letterbox_round_trips_coordinates() {
        let image = DynamicImage::ImageRgb8(RgbImage::new(1280, 640));
        let (input, letterbox) = Letterbox::apply(&image, DETECTOR_INPUT_SIZE);
        assert_eq!(input.shape(), &[1, 3, 640, 640]);
        assert_eq!(letterbox.pad_y, 160.0);
        assert_eq!(input[[0, 0, 0, 0]], LETTERBOX_FILL as f32 / 255.0);

        let restored = letterbox.restore(BoundingBox::new(10.0, 170.0, 110.0, 270.0));
        assert_eq!(restored, BoundingBox::new(20.0, 20.0, 220.0, 220.0));
    }

    #[test]
    fn narrow_portrait_restores_each_axis_with_its_own_scale() {
        // 640 * 101 / 1000 truncates to 64, so x and y are resized by different factors.
        let image = DynamicImage::ImageRgb8(RgbImage::new(101, 1000));
        let (_, letterbox) = Letterbox::apply(&image, DETECTOR_INPUT_SIZE);
        assert_eq!(letterbox.pad_x, 288.0);
        assert_eq!(letterbox.pad_y, 0.0);

        let restored = letterbox.restore(BoundingBox::new(288.0, 64.0, 352.0, 576.0));
        let close = |a: f64, b: f64| (a - b).abs() < 1e-6;
        assert!(close(restored.x1, 0.0));
        assert!(close(restored.x2, 101.0));
        assert!(close(restored.y1, 100.0), "y1 = {}", restored.y1);
        assert!(close(restored.y2, 900.0), "y2 = {}", restored.y2);
    }
}
