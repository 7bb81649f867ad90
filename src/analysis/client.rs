//! Remote classifier client
//!
//! One multipart POST to `<server>/upload` per attempt, with the WAV file in
//! the `audio` field and the model identifier in the `model` field.

use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use thiserror::Error;

use super::outcome::{parse_outcome, AnalysisModel, AnalysisOutcome};

/// Terminal answer from the classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifierReply {
    /// 2xx response with a verdict or a server-classified error.
    Accepted(AnalysisOutcome),
    /// 4xx response; the request must not be repeated.
    Rejected(AnalysisOutcome),
}

impl ClassifierReply {
    pub fn outcome(&self) -> &AnalysisOutcome {
        match self {
            ClassifierReply::Accepted(outcome) | ClassifierReply::Rejected(outcome) => outcome,
        }
    }

    pub fn into_outcome(self) -> AnalysisOutcome {
        match self {
            ClassifierReply::Accepted(outcome) | ClassifierReply::Rejected(outcome) => outcome,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    /// Connection, DNS or body transfer failure.
    #[error("Network error: {0}")]
    Transport(String),
    /// 5xx response.
    #[error("Classifier server error ({status}): {message}")]
    Server { status: u16, message: String },
    /// Anything that retrying cannot fix.
    #[error("{0}")]
    Unexpected(String),
}

impl ClassifyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClassifyError::Transport(_) | ClassifyError::Server { .. })
    }
}

#[async_trait]
pub trait Classifier: Send + Sync + 'static {
    /// Submit `audio` for analysis with `model`. `file_name` is the name the
    /// file is uploaded under.
    async fn classify(
        &self,
        audio: &Path,
        file_name: &str,
        model: AnalysisModel,
    ) -> Result<ClassifierReply, ClassifyError>;
}

/// Classifier reached over HTTP.
///
/// No request timeout is configured; a hung request lasts until the job is
/// canceled.
pub struct HttpClassifier {
    client: Client,
    upload_url: String,
}

impl HttpClassifier {
    pub fn new(server_url: &str) -> Result<Self, ClassifyError> {
        let client = Client::builder()
            .build()
            .map_err(|e| ClassifyError::Unexpected(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            upload_url: upload_url(server_url),
        })
    }

    pub fn upload_url(&self) -> &str {
        &self.upload_url
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        audio: &Path,
        file_name: &str,
        model: AnalysisModel,
    ) -> Result<ClassifierReply, ClassifyError> {
        let file_bytes = tokio::fs::read(audio).await.map_err(|e| {
            ClassifyError::Unexpected(format!("Failed to read audio file {:?}: {}", audio, e))
        })?;

        log::info!(
            "Submitting {} ({} bytes) to {} with {}",
            file_name,
            file_bytes.len(),
            self.upload_url,
            model
        );

        let audio_part = Part::bytes(file_bytes)
            .file_name(file_name.to_string())
            .mime_str("audio/wav")
            .map_err(|e| ClassifyError::Unexpected(e.to_string()))?;

        let form = Form::new()
            .part("audio", audio_part)
            .text("model", model.as_str());

        let response = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClassifyError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| ClassifyError::Transport(e.to_string()))?;

        log::debug!("Classifier responded {}: {}", status, body);
        interpret_response(status, &body, model)
    }
}

/// `<server>/upload`, tolerating a trailing slash on the server URL.
pub fn upload_url(server_url: &str) -> String {
    format!("{}/upload", server_url.trim_end_matches('/'))
}

/// Map an HTTP status and body to a classifier reply.
///
/// 4xx bodies that do not decode are kept verbatim as the error message.
pub fn interpret_response(
    status: u16,
    body: &str,
    requested: AnalysisModel,
) -> Result<ClassifierReply, ClassifyError> {
    match status {
        200..=299 => parse_outcome(body, requested)
            .map(ClassifierReply::Accepted)
            .map_err(|e| ClassifyError::Unexpected(e.to_string())),
        400..=499 => {
            let outcome = parse_outcome(body, requested).unwrap_or_else(|_| {
                let message = if body.trim().is_empty() {
                    format!("Request rejected (HTTP {})", status)
                } else {
                    body.trim().to_string()
                };
                AnalysisOutcome::Error {
                    message,
                    model: Some(requested),
                }
            });
            log::warn!("Classifier rejected request ({}): {:?}", status, outcome);
            Ok(ClassifierReply::Rejected(outcome))
        }
        500..=599 => Err(ClassifyError::Server {
            status,
            message: body.trim().to_string(),
        }),
        other => Err(ClassifyError::Unexpected(format!(
            "Unexpected HTTP status {}",
            other
        ))),
    }
}
