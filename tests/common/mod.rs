#![allow(dead_code)]

use async_trait::async_trait;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use xvision::classifier::{ClassifierModel, FractureClassifier};
use xvision::detector::Detector;
use xvision::models::{BoundingBox, Label, NewPrediction, PredictionRecord};
use xvision::persistence::{PredictionStore, SqlitePredictionStore};
use xvision::report::ReportGenerator;
use xvision::storage::{BlobStore, FsBlobStore};
use xvision::{Orchestrator, PipelineError, ReportFailurePolicy};

/// Classifier network that always answers with the same P(no fracture).
///
/// Each call is held for `hold`, and the highest number of overlapping calls is kept in `peak`.
pub struct FixedScore {
    pub raw: f32,
    pub hold: Duration,
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub peak: AtomicUsize,
}

impl FixedScore {
    pub fn new(raw: f32, hold: Duration) -> Self {
        Self {
            raw,
            hold,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl ClassifierModel for FixedScore {
    fn predict_raw(&self, _image: &DynamicImage) -> Result<f32, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if !self.hold.is_zero() {
            std::thread::sleep(self.hold);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.raw)
    }
}

pub struct StubDetector {
    pub result: Result<Vec<BoundingBox>, String>,
    pub calls: AtomicUsize,
}

impl Detector for StubDetector {
    fn detect(&self, _image_bytes: &[u8]) -> Result<Vec<BoundingBox>, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result.clone().map_err(PipelineError::Inference)
    }
}

pub struct StubReporter {
    pub result: Result<String, String>,
    pub calls: Mutex<Vec<(Label, f64, Option<BoundingBox>)>>,
}

#[async_trait]
impl ReportGenerator for StubReporter {
    async fn generate(
        &self,
        label: Label,
        confidence: f64,
        primary_box: Option<BoundingBox>,
    ) -> Result<String, PipelineError> {
        self.calls
            .lock()
            .unwrap()
            .push((label, confidence, primary_box));
        self.result.clone().map_err(PipelineError::ReportGeneration)
    }
}

/// Blob store whose disk is always full.
pub struct FullDisk;

impl BlobStore for FullDisk {
    fn save(&self, path: &str, _bytes: &[u8]) -> Result<(), PipelineError> {
        Err(PipelineError::Storage(format!(
            "could not create {}: No space left on device",
            path
        )))
    }

    fn remove(&self, path: &str) -> Result<(), PipelineError> {
        Err(PipelineError::Storage(format!("{} does not exist", path)))
    }

    fn base_url_for(&self, base_url: &str, path: &str) -> String {
        format!("{}{}", base_url, path)
    }
}

/// Record store whose database is locked.
pub struct LockedDatabase;

#[async_trait]
impl PredictionStore for LockedDatabase {
    async fn create_prediction_record(
        &self,
        _prediction: NewPrediction,
    ) -> Result<PredictionRecord, PipelineError> {
        Err(PipelineError::Storage("database is locked".into()))
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub model: Arc<FixedScore>,
    pub detector: Arc<StubDetector>,
    pub reporter: Arc<StubReporter>,
    pub records: Arc<SqlitePredictionStore>,
    pub uploads: TempDir,
}

impl Harness {
    pub fn raw_files(&self) -> Vec<String> {
        list(&self.uploads.path().join("raw"))
    }

    pub fn annotated_files(&self) -> Vec<String> {
        list(&self.uploads.path().join("annotated"))
    }

    pub fn detector_calls(&self) -> usize {
        self.detector.calls.load(Ordering::SeqCst)
    }

    pub fn report_calls(&self) -> Vec<(Label, f64, Option<BoundingBox>)> {
        self.reporter.calls.lock().unwrap().clone()
    }
}

pub struct Scenario {
    pub raw_score: f32,
    pub detection: Result<Vec<BoundingBox>, String>,
    pub report: Result<String, String>,
    pub report_failure: ReportFailurePolicy,
    pub max_concurrency: usize,
    pub classify_hold: Duration,
    pub blobs: Option<Arc<dyn BlobStore>>,
    pub records: Option<Arc<dyn PredictionStore>>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            raw_score: 0.92,
            detection: Ok(Vec::new()),
            report: Ok("Generated fracture report.".into()),
            report_failure: ReportFailurePolicy::Fail,
            max_concurrency: 4,
            classify_hold: Duration::ZERO,
            blobs: None,
            records: None,
        }
    }
}

pub async fn harness(scenario: Scenario) -> Harness {
    let uploads = TempDir::new().expect("Failed to create upload dir");
    let model = Arc::new(FixedScore::new(scenario.raw_score, scenario.classify_hold));
    let detector = Arc::new(StubDetector {
        result: scenario.detection,
        calls: AtomicUsize::new(0),
    });
    let reporter = Arc::new(StubReporter {
        result: scenario.report,
        calls: Mutex::new(Vec::new()),
    });
    let records = Arc::new(
        SqlitePredictionStore::in_memory()
            .await
            .expect("Failed to open in-memory store"),
    );

    let blobs: Arc<dyn BlobStore> = match scenario.blobs {
        Some(blobs) => blobs,
        None => Arc::new(FsBlobStore::new(uploads.path(), "uploads")),
    };

    let orchestrator = Orchestrator::new(
        Arc::new(FractureClassifier::new(model.clone())),
        detector.clone(),
        reporter.clone(),
        blobs,
        scenario.records.unwrap_or_else(|| records.clone() as Arc<dyn PredictionStore>),
    )
    .with_max_concurrency(scenario.max_concurrency)
    .with_report_failure(scenario.report_failure);

    Harness {
        orchestrator,
        model,
        detector,
        reporter,
        records,
        uploads,
    }
}

/// 200x160 grey PNG.
pub fn xray_png() -> Vec<u8> {
    let img = RgbImage::from_pixel(200, 160, Rgb([90, 90, 90]));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageOutputFormat::Png)
        .expect("Failed to encode test image");
    buf.into_inner()
}

fn list(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
