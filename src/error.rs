//! Error types for the prediction pipeline.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

/// Failure of one prediction pipeline run.
///
/// Every variant is fatal for the request it occurred in. The message is passed
/// through to the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The uploaded bytes are not a decodable image.
    #[error("could not decode image: {0}")]
    Decode(String),

    /// The classifier or detector runtime failed.
    #[error("inference failed: {0}")]
    Inference(String),

    /// The external text-generation service failed or timed out.
    #[error("report generation failed: {0}")]
    ReportGeneration(String),

    /// Blob or record persistence failed.
    #[error("storage failed: {0}")]
    Storage(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::ReportGeneration(err.to_string())
    }
}

impl ResponseError for PipelineError {
    fn status_code(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "detail": self.to_string() }))
    }
}

/// Invalid startup configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} has an invalid value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("malformed token entry {0:?}, expected token=user_id")]
    MalformedToken(String),
}
