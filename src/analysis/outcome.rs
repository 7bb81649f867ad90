//! Classifier models and analysis outcomes
//!
//! `AnalysisOutcome` is what gets persisted with each record. `RecordStatus`
//! is the view-side status, which adds the transient `Processing` overlay
//! shown while a job is active.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Model used by the remote classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisModel {
    #[serde(alias = "Model1")]
    Model1,
    #[serde(alias = "Model2")]
    Model2,
    #[serde(alias = "Model3")]
    Model3,
}

impl AnalysisModel {
    pub const ALL: [AnalysisModel; 3] = [
        AnalysisModel::Model1,
        AnalysisModel::Model2,
        AnalysisModel::Model3,
    ];

    /// Identifier sent in the `model` form field.
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisModel::Model1 => "model1",
            AnalysisModel::Model2 => "model2",
            AnalysisModel::Model3 => "model3",
        }
    }

    /// Case-insensitive lookup by wire name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for AnalysisModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AnalysisModel::Model1 => "Model1",
            AnalysisModel::Model2 => "Model2",
            AnalysisModel::Model3 => "Model3",
        };
        f.write_str(label)
    }
}

impl FromStr for AnalysisModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| {
            format!(
                "unknown model '{}', expected one of: model1, model2, model3",
                s
            )
        })
    }
}

/// Durable analysis result stored with a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tag")]
pub enum AnalysisOutcome {
    #[default]
    NotProcessed,
    Healthy {
        model: AnalysisModel,
    },
    Pathology {
        model: AnalysisModel,
    },
    Error {
        message: String,
        #[serde(default)]
        model: Option<AnalysisModel>,
    },
}

impl AnalysisOutcome {
    /// Records that have not produced a verdict may be (re)submitted.
    pub fn is_submittable(&self) -> bool {
        matches!(
            self,
            AnalysisOutcome::NotProcessed | AnalysisOutcome::Error { .. }
        )
    }
}

/// Status shown for a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    NotProcessed,
    Processing(AnalysisModel),
    Healthy(AnalysisModel),
    Pathology(AnalysisModel),
    Error {
        message: String,
        model: Option<AnalysisModel>,
    },
}

impl RecordStatus {
    /// Durable outcome, replaced by `Processing` while a job is active.
    pub fn overlay(outcome: &AnalysisOutcome, processing: Option<AnalysisModel>) -> Self {
        if let Some(model) = processing {
            return RecordStatus::Processing(model);
        }
        match outcome {
            AnalysisOutcome::NotProcessed => RecordStatus::NotProcessed,
            AnalysisOutcome::Healthy { model } => RecordStatus::Healthy(*model),
            AnalysisOutcome::Pathology { model } => RecordStatus::Pathology(*model),
            AnalysisOutcome::Error { message, model } => RecordStatus::Error {
                message: message.clone(),
                model: *model,
            },
        }
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, RecordStatus::Processing(_))
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordStatus::NotProcessed => write!(f, "not processed"),
            RecordStatus::Processing(model) => write!(f, "processing ({})", model),
            RecordStatus::Healthy(model) => write!(f, "healthy ({})", model),
            RecordStatus::Pathology(model) => write!(f, "pathology ({})", model),
            RecordStatus::Error {
                message,
                model: Some(model),
            } => write!(f, "error ({}): {}", model, message),
            RecordStatus::Error {
                message,
                model: None,
            } => write!(f, "error: {}", message),
        }
    }
}

/// Response body that maps to no outcome.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unrecognized classifier response: {0}")]
pub struct MalformedResponse(pub String);

/// Decode a classifier response body.
///
/// `{"status": n, "model": m}` is a verdict: `n` truncated to an integer is
/// healthy when it equals 1 and pathology otherwise. `{"error": e, "model": m}`
/// is a server-classified error. An unknown or missing `model` falls back to
/// the model that was requested.
pub fn parse_outcome(
    body: &str,
    requested: AnalysisModel,
) -> Result<AnalysisOutcome, MalformedResponse> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| MalformedResponse(format!("invalid JSON: {}", e)))?;
    let object = value
        .as_object()
        .ok_or_else(|| MalformedResponse("expected a JSON object".to_string()))?;

    let model = object
        .get("model")
        .and_then(Value::as_str)
        .and_then(AnalysisModel::from_name)
        .unwrap_or(requested);

    if let Some(status) = object.get("status") {
        let status = status
            .as_f64()
            .ok_or_else(|| MalformedResponse(format!("non-numeric status {}", status)))?;
        return Ok(if status.trunc() as i64 == 1 {
            AnalysisOutcome::Healthy { model }
        } else {
            AnalysisOutcome::Pathology { model }
        });
    }

    if let Some(error) = object.get("error") {
        let message = match error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(AnalysisOutcome::Error {
            message,
            model: Some(model),
        });
    }

    Err(MalformedResponse(
        "neither 'status' nor 'error' present".to_string(),
    ))
}
