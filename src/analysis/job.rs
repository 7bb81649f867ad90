//! Analysis jobs
//!
//! One job submits one record to the classifier and keeps retrying transient
//! failures at a fixed interval until it reaches a terminal result or is
//! canceled. Cancellation is cooperative: the token is checked before every
//! attempt, raced against the request and the backoff wait, and checked again
//! before anything is persisted.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::client::{Classifier, ClassifierReply};
use super::outcome::{AnalysisModel, AnalysisOutcome};
use crate::store::{self, AudioRecord, RecordStore};

pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// 2xx reply, persisted.
    Completed(AnalysisOutcome),
    /// 4xx reply, persisted as returned.
    Rejected(AnalysisOutcome),
    /// Canceled; nothing persisted.
    Canceled,
    /// Unrecoverable failure; nothing persisted.
    Failed(String),
}

/// Terminal result sent back to whoever owns the job engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub job_id: Uuid,
    pub record_id: i64,
    pub model: AnalysisModel,
    pub attempts: u32,
    pub result: JobResult,
}

/// Handle to a running job.
pub struct JobHandle {
    job_id: Uuid,
    record_id: i64,
    model: AnalysisModel,
    cancel: CancellationToken,
    attempts: Arc<AtomicU32>,
    task: JoinHandle<JobResult>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub fn record_id(&self) -> i64 {
        self.record_id
    }

    pub fn model(&self) -> AnalysisModel {
        self.model
    }

    /// Requests started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the job to end.
    pub async fn join(self) -> JobResult {
        match self.task.await {
            Ok(result) => result,
            Err(e) => JobResult::Failed(format!("analysis task failed: {}", e)),
        }
    }
}

#[derive(Clone)]
pub struct JobEngine {
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn RecordStore>,
    backoff: Duration,
    reports: mpsc::UnboundedSender<JobReport>,
}

struct JobContext {
    job_id: Uuid,
    model: AnalysisModel,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn RecordStore>,
    backoff: Duration,
    cancel: CancellationToken,
    attempts: Arc<AtomicU32>,
}

impl JobEngine {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn RecordStore>,
        backoff: Duration,
        reports: mpsc::UnboundedSender<JobReport>,
    ) -> Self {
        Self {
            classifier,
            store,
            backoff,
            reports,
        }
    }

    /// Spawn a job for `record`. The caller keeps at most one per record.
    pub fn submit(&self, record: AudioRecord, model: AnalysisModel) -> JobHandle {
        let job_id = Uuid::new_v4();
        let record_id = record.id;
        let cancel = CancellationToken::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let ctx = JobContext {
            job_id,
            model,
            classifier: self.classifier.clone(),
            store: self.store.clone(),
            backoff: self.backoff,
            cancel: cancel.clone(),
            attempts: attempts.clone(),
        };
        let reports = self.reports.clone();

        log::info!(
            "Analysis job {} submitted for record {} with {}",
            job_id,
            record_id,
            model
        );

        let task = tokio::spawn(async move {
            let attempts = ctx.attempts.clone();
            let result = run_job(ctx, record).await;
            let report = JobReport {
                job_id,
                record_id,
                model,
                attempts: attempts.load(Ordering::SeqCst),
                result: result.clone(),
            };
            if reports.send(report).is_err() {
                log::debug!("Job report for {} dropped: receiver closed", job_id);
            }
            result
        });

        JobHandle {
            job_id,
            record_id,
            model,
            cancel,
            attempts,
            task,
        }
    }
}

async fn run_job(ctx: JobContext, record: AudioRecord) -> JobResult {
    loop {
        if ctx.cancel.is_cancelled() {
            return canceled(&ctx, record.id);
        }

        let attempt = ctx.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!(
            "Job {} attempt {} for record {}",
            ctx.job_id,
            attempt,
            record.id
        );

        let reply = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return canceled(&ctx, record.id),
            reply = ctx.classifier.classify(&record.file_path, &record.file_name, ctx.model) => reply,
        };

        match reply {
            Ok(reply) => {
                if ctx.cancel.is_cancelled() {
                    return canceled(&ctx, record.id);
                }
                return persist(&ctx, &record, reply).await;
            }
            Err(e) if e.is_retryable() => {
                log::warn!(
                    "Job {} attempt {} failed: {}. Retrying in {:?}",
                    ctx.job_id,
                    attempt,
                    e,
                    ctx.backoff
                );
            }
            Err(e) => {
                log::error!("Job {} for record {} failed: {}", ctx.job_id, record.id, e);
                return JobResult::Failed(e.to_string());
            }
        }

        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return canceled(&ctx, record.id),
            _ = tokio::time::sleep(ctx.backoff) => {}
        }
    }
}

async fn persist(ctx: &JobContext, record: &AudioRecord, reply: ClassifierReply) -> JobResult {
    let rejected = matches!(reply, ClassifierReply::Rejected(_));
    let outcome = reply.into_outcome();

    let (id, status) = (record.id, outcome.clone());
    let saved = store::run_blocking(&ctx.store, move |s| s.set_status(id, status)).await;
    match saved {
        Ok(_) => {
            log::info!(
                "Job {} finished for record {}: {:?}",
                ctx.job_id,
                record.id,
                outcome
            );
            if rejected {
                JobResult::Rejected(outcome)
            } else {
                JobResult::Completed(outcome)
            }
        }
        Err(e) => {
            log::error!(
                "Job {} could not save result for record {}: {}",
                ctx.job_id,
                record.id,
                e
            );
            JobResult::Failed(format!("Failed to save analysis result: {}", e))
        }
    }
}

fn canceled(ctx: &JobContext, record_id: i64) -> JobResult {
    log::info!("Job {} for record {} canceled", ctx.job_id, record_id);
    JobResult::Canceled
}
