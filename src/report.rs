//! Natural-language report generation through an OpenAI-compatible chat endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::PipelineError;
use crate::models::{BoundingBox, Label};

pub const SYSTEM_PROMPT: &str = "You are a medical report assistant.";

#[async_trait]
pub trait ReportGenerator: Send + Sync {
    /// Writes a report for one classification. A fractured label requires `primary_box`.
    async fn generate(
        &self,
        label: Label,
        confidence: f64,
        primary_box: Option<BoundingBox>,
    ) -> Result<String, PipelineError>;
}

/// Builds the user prompt for `label`.
pub fn build_prompt(
    label: Label,
    confidence: f64,
    primary_box: Option<BoundingBox>,
) -> Result<String, PipelineError> {
    match label {
        Label::NotFractured => Ok(format!(
            "You are a medical radiology assistant. The X-ray image analysis shows NO fracture \
             with confidence {:.4}.\n\
             Write a concise statement confirming no fracture detected and advise what a patient \
             should do next (e.g., follow-up if pain persists).",
            confidence
        )),
        Label::Fractured => {
            let b = primary_box.ok_or_else(|| {
                PipelineError::ReportGeneration(
                    "a fracture report needs the primary bounding box".into(),
                )
            })?;
            Ok(format!(
                "You are a medical radiology assistant. Based on the following object detection \
                 result from an X-ray image, generate a clear, professional diagnostic report:\n\n\
                 - Fracture Label: {}\n\
                 - Detection Confidence: {:.4}\n\
                 - Bounding Box: (x1={:?}, y1={:?}, x2={:?}, y2={:?})\n\n\
                 Make sure the report includes diagnosis, potential implications, \
                 splinting/treatment guidance, and follow-up instructions.",
                label, confidence, b.x1, b.y1, b.x2, b.y2
            ))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportSettings {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// One synchronous `chat/completions` call per report. No retries, no streaming.
pub struct ChatCompletionsReporter {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl ChatCompletionsReporter {
    pub fn new(settings: ReportSettings) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.api_base.trim_end_matches('/')),
            api_key: settings.api_key,
            model: settings.model,
        })
    }
}

#[async_trait]
impl ReportGenerator for ChatCompletionsReporter {
    async fn generate(
        &self,
        label: Label,
        confidence: f64,
        primary_box: Option<BoundingBox>,
    ) -> Result<String, PipelineError> {
        let prompt = build_prompt(label, confidence, primary_box)?;
        let body = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(PipelineError::ReportGeneration(format!(
                "text service returned {}: {}",
                status, detail
            )));
        }

        let reply: ChatResponse = response.json().await?;
        reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                PipelineError::ReportGeneration("text service returned no content".into())
            })
    }
}
