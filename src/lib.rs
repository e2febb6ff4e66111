//! X-ray fracture prediction backend.
//!
//! An upload is classified, localized when positive, annotated, stored and described
//! in a short report. [`orchestrator::Orchestrator`] drives that sequence; every model
//! and storage backend it talks to sits behind a trait so it can be swapped at startup.

pub mod auth;
pub mod classifier;
pub mod config;
pub mod detector;
pub mod error;
pub mod handlers;
pub mod imaging;
pub mod models;
pub mod onnx;
pub mod orchestrator;
pub mod persistence;
pub mod report;
pub mod storage;

pub use error::{ConfigError, PipelineError};
pub use models::{BoundingBox, Label, PredictionRequest, PredictionResponse, UserId};
pub use orchestrator::{Orchestrator, ReportFailurePolicy};
