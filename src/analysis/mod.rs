//! Analysis module for Pathology Detector
//!
//! Submits saved recordings to the remote classifier and retries transient
//! failures until a result arrives or the job is canceled.

mod client;
pub mod job;
mod outcome;

pub use client::{
    interpret_response, upload_url, Classifier, ClassifierReply, ClassifyError, HttpClassifier,
};
pub use job::{JobEngine, JobHandle, JobReport, JobResult, DEFAULT_RETRY_BACKOFF};
pub use outcome::{parse_outcome, AnalysisModel, AnalysisOutcome, MalformedResponse, RecordStatus};
