//! Prediction pipeline controller.
//!
//! One run per request, strictly sequential:
//!
//! ```text
//! Received -> Classified -> (Detected)? -> (Annotated)? -> Stored -> Reported -> Completed
//! ```
//!
//! Any stage error ends the run as `Failed` and nothing partial is returned. The
//! prediction record is appended exactly once, and only when every stage before the
//! report succeeded.

use actix_web::web::{self, Bytes};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::Instrument;
use uuid::Uuid;

use crate::classifier::Classifier;
use crate::detector::Detector;
use crate::error::PipelineError;
use crate::imaging;
use crate::models::{
    BoundingBox, Classification, Finding, Label, NewPrediction, PredictionRequest,
    PredictionResponse, UserId,
};
use crate::persistence::PredictionStore;
use crate::report::ReportGenerator;
use crate::storage::{self, BlobStore, ANNOTATED_DIR, RAW_DIR};

pub const NO_FRACTURE_REPORT: &str = "No fracture was detected.";
pub const MISSING_BOX_REPORT: &str =
    "A fracture was detected, but bounding box could not be located.";

/// What to do when the text service fails after everything else succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFailurePolicy {
    /// Fail the whole request.
    #[default]
    Fail,
    /// Answer without a report.
    Omit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Classify,
    Detect,
    Annotate,
    Store,
    Report,
}

impl Stage {
    fn as_str(&self) -> &'static str {
        match self {
            Stage::Classify => "classify",
            Stage::Detect => "detect",
            Stage::Annotate => "annotate",
            Stage::Store => "store",
            Stage::Report => "report",
        }
    }
}

/// Handles shared by every pipeline run. All of them are constructed once at startup.
pub struct Orchestrator {
    classifier: Arc<dyn Classifier>,
    detector: Arc<dyn Detector>,
    reporter: Arc<dyn ReportGenerator>,
    blobs: Arc<dyn BlobStore>,
    records: Arc<dyn PredictionStore>,
    admission: Semaphore,
    report_failure: ReportFailurePolicy,
}

impl Orchestrator {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        detector: Arc<dyn Detector>,
        reporter: Arc<dyn ReportGenerator>,
        blobs: Arc<dyn BlobStore>,
        records: Arc<dyn PredictionStore>,
    ) -> Self {
        Self {
            classifier,
            detector,
            reporter,
            blobs,
            records,
            admission: Semaphore::new(Semaphore::MAX_PERMITS),
            report_failure: ReportFailurePolicy::Fail,
        }
    }

    /// Caps the number of pipelines running at once; later requests wait for a slot.
    pub fn with_max_concurrency(mut self, permits: usize) -> Self {
        self.admission = Semaphore::new(permits.max(1));
        self
    }

    pub fn with_report_failure(mut self, policy: ReportFailurePolicy) -> Self {
        self.report_failure = policy;
        self
    }

    /// Runs the whole pipeline for one upload. `base_url` is the caller-visible root of
    /// this service and prefixes the annotated image URL.
    pub async fn submit_prediction(
        &self,
        request: PredictionRequest,
        base_url: &str,
    ) -> Result<PredictionResponse, PipelineError> {
        let span = tracing::info_span!(
            "prediction",
            request_id = %Uuid::new_v4(),
            user_id = %request.user_id,
        );

        async move {
            let _permit = self
                .admission
                .acquire()
                .await
                .map_err(|e| PipelineError::Inference(e.to_string()))?;

            let response = self.run(request, base_url).await?;
            tracing::info!(
                label = %response.label,
                confidence = response.confidence,
                boxes = response.boxes.len(),
                "prediction completed"
            );
            Ok::<_, PipelineError>(response)
        }
        .instrument(span)
        .await
    }

    async fn run(
        &self,
        request: PredictionRequest,
        base_url: &str,
    ) -> Result<PredictionResponse, PipelineError> {
        let PredictionRequest { image, user_id } = request;

        let classification = self.classify(image.clone()).await?;
        let label = classification.label();
        let confidence = classification.confidence();

        let finding = match label {
            Label::NotFractured => Finding::NotFractured,
            Label::Fractured => Finding::fractured(self.detect(image.clone()).await?),
        };
        tracing::debug!(stage = Stage::Detect.as_str(), ?finding, "branch selected");

        let annotated_path = match &finding {
            Finding::FracturedWithBoxes { .. } => {
                Some(self.annotate(image.clone(), &finding).await?)
            }
            Finding::NotFractured | Finding::FracturedNoBox => None,
        };

        self.store(image, user_id, &classification).await?;

        let annotated_image_url =
            annotated_path.map(|path| self.blobs.base_url_for(base_url, &path));

        let report = self.report(&finding, confidence).await?;

        Ok(PredictionResponse {
            label,
            confidence,
            boxes: finding.boxes(),
            annotated_image_url,
            report,
        })
    }

    async fn classify(&self, image: Bytes) -> Result<Classification, PipelineError> {
        let classifier = self.classifier.clone();
        blocking(Stage::Classify, move || classifier.classify(&image)).await
    }

    async fn detect(&self, image: Bytes) -> Result<Vec<BoundingBox>, PipelineError> {
        let detector = self.detector.clone();
        blocking(Stage::Detect, move || detector.detect(&image)).await
    }

    /// Draws every box on a copy of the upload and stores it; returns the blob path.
    async fn annotate(&self, image: Bytes, finding: &Finding) -> Result<String, PipelineError> {
        let boxes = finding.boxes();
        let blobs = self.blobs.clone();
        blocking(Stage::Annotate, move || {
            let png = imaging::annotate_bytes(&image, &boxes)?;
            let path = storage::blob_path(ANNOTATED_DIR, &storage::unique_filename("png"));
            blobs.save(&path, &png)?;
            Ok(path)
        })
        .await
    }

    /// Stores the original upload under a fresh name and appends the prediction record.
    async fn store(
        &self,
        image: Bytes,
        user_id: UserId,
        classification: &Classification,
    ) -> Result<(), PipelineError> {
        let filename = storage::unique_filename(imaging::extension_for(&image));
        let path = storage::blob_path(RAW_DIR, &filename);
        let blobs = self.blobs.clone();
        let saved = path.clone();
        blocking(Stage::Store, move || blobs.save(&saved, &image)).await?;

        let inserted = self
            .records
            .create_prediction_record(NewPrediction {
                user_id,
                image_filename: filename,
                label: classification.label(),
                confidence: classification.fracture_probability,
            })
            .await;

        match inserted {
            Ok(record) => {
                tracing::debug!(stage = Stage::Store.as_str(), record_id = record.id, "stored");
                Ok(())
            }
            Err(err) => {
                tracing::error!(stage = Stage::Store.as_str(), error = %err, "record insert failed");
                // The upload has no record now; drop it.
                if let Err(cleanup) = self.blobs.remove(&path) {
                    tracing::error!(
                        stage = Stage::Store.as_str(),
                        path = %path,
                        error = %cleanup,
                        "orphaned upload left in blob store"
                    );
                }
                Err(err)
            }
        }
    }

    async fn report(
        &self,
        finding: &Finding,
        confidence: f64,
    ) -> Result<Option<String>, PipelineError> {
        let primary = match finding {
            Finding::NotFractured => return Ok(Some(NO_FRACTURE_REPORT.to_string())),
            Finding::FracturedNoBox => return Ok(Some(MISSING_BOX_REPORT.to_string())),
            Finding::FracturedWithBoxes { primary, .. } => *primary,
        };

        match self
            .reporter
            .generate(Label::Fractured, confidence, Some(primary))
            .await
        {
            Ok(text) => Ok(Some(text)),
            Err(err) => match self.report_failure {
                ReportFailurePolicy::Fail => {
                    tracing::error!(stage = Stage::Report.as_str(), error = %err, "report failed");
                    Err(err)
                }
                ReportFailurePolicy::Omit => {
                    tracing::warn!(
                        stage = Stage::Report.as_str(),
                        error = %err,
                        "report failed, answering without one"
                    );
                    Ok(None)
                }
            },
        }
    }
}

/// Runs `f` on the blocking pool, logging failures with their stage.
async fn blocking<F, T>(stage: Stage, f: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    let result = web::block(f)
        .await
        .map_err(|e| PipelineError::Inference(format!("{} task aborted: {}", stage.as_str(), e)))
        .and_then(|inner| inner);
    match &result {
        Ok(_) => tracing::debug!(stage = stage.as_str(), "stage finished"),
        Err(err) => tracing::error!(stage = stage.as_str(), error = %err, "stage failed"),
    }
    result
}
