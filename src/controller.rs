//! Job lifecycle, progress and payload reporting.
//!
//! Progress and payload writes are sent over a channel to a per-run writer
//! task and written in order; a failed write is logged and dropped. Terminal
//! transitions go straight to the store and return their error so the owner
//! of the run can retry them.

use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::*;
use uuid::Uuid;

use crate::error::{JobError, GENERIC_FAILURE_MESSAGE};
use crate::payload::JobPayload;
use crate::store::JobStore;

/// Progress written when a job is picked up.
const STARTED_PROGRESS: i16 = 1;

#[derive(Clone)]
pub struct JobController {
    jobs: Arc<dyn JobStore>,
}

impl JobController {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        JobController { jobs }
    }

    /// Opens the reporting handle for one run of a job.
    pub fn context(&self, job_id: Uuid) -> JobContext {
        let (updates, recv) = mpsc::unbounded_channel();
        tokio::spawn(
            write_status(job_id, self.jobs.clone(), recv)
                .instrument(info_span!("status_writer", job_id = %job_id)),
        );
        JobContext {
            id: job_id,
            jobs: self.jobs.clone(),
            published: Arc::new(AtomicI16::new(0)),
            updates,
        }
    }

    pub async fn complete_with_result(&self, job_id: Uuid, result_ref: Uuid, message: &str) -> Result<()> {
        self.jobs.complete_job(job_id, result_ref, message).await?;
        info!(job_id = %job_id, result_ref = %result_ref, "Job completed");
        Ok(())
    }

    /// Marks a job failed. `error_message` is only logged; the job row gets
    /// `public_message`, or a generic message when none is given.
    pub async fn fail_with(
        &self,
        job_id: Uuid,
        error_message: &str,
        public_message: Option<&str>,
    ) -> Result<()> {
        let public = public_message.unwrap_or(GENERIC_FAILURE_MESSAGE);
        self.jobs.fail_job(job_id, public).await?;
        info!(job_id = %job_id, error = %error_message, "Job failed");
        Ok(())
    }
}

enum StatusUpdate {
    Begin { message: String },
    Progress { progress: i16, message: String },
    Payload(Value),
    Flush(oneshot::Sender<()>),
}

async fn write_status(
    job_id: Uuid,
    jobs: Arc<dyn JobStore>,
    mut recv: mpsc::UnboundedReceiver<StatusUpdate>,
) {
    while let Some(update) = recv.recv().await {
        let result = match update {
            StatusUpdate::Begin { message } => match jobs.begin_job(job_id, STARTED_PROGRESS, &message).await {
                Ok(true) => Ok(()),
                Ok(false) => {
                    debug!("Job already processing");
                    Ok(())
                }
                Err(err) => Err(err),
            },
            StatusUpdate::Progress { progress, message } => {
                jobs.update_progress(job_id, progress, &message).await
            }
            StatusUpdate::Payload(patch) => jobs.merge_payload(job_id, patch).await,
            StatusUpdate::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(error = ?err, "Status write failed, continuing");
        }
    }
}

/// Reporting handle for one run of one job.
#[derive(Clone)]
pub struct JobContext {
    id: Uuid,
    jobs: Arc<dyn JobStore>,
    published: Arc<AtomicI16>,
    updates: mpsc::UnboundedSender<StatusUpdate>,
}

impl JobContext {
    /// queued → processing. A second call on a processing job is a no-op.
    pub fn start_processing(&self, message: &str) {
        self.published.fetch_max(STARTED_PROGRESS, Ordering::SeqCst);
        self.send(StatusUpdate::Begin {
            message: message.to_string(),
        });
    }

    /// Publishes `percent`, clamped to 0..=100 and never below a value
    /// already published by this run.
    pub fn report_progress(&self, percent: i64, message: &str) {
        let clamped = percent.clamp(0, 100) as i16;
        let previous = self.published.fetch_max(clamped, Ordering::SeqCst);
        self.send(StatusUpdate::Progress {
            progress: previous.max(clamped),
            message: message.to_string(),
        });
    }

    pub fn progress(&self) -> i16 {
        self.published.load(Ordering::SeqCst)
    }

    pub fn merge_payload(&self, partial: &JobPayload) {
        self.send(StatusUpdate::Payload(partial.to_patch()));
    }

    /// Untyped merge, for patches that must clear keys with explicit nulls.
    pub fn merge_payload_value(&self, patch: Value) {
        self.send(StatusUpdate::Payload(patch));
    }

    /// Reports the teardown of a cancelled run. Not a status of its own.
    pub fn enter_cleanup(&self, message: &str) {
        self.merge_payload(&JobPayload::phase("cleanup"));
        self.report_progress(self.progress() as i64, message);
    }

    /// Reads the cancellation flag. A failed read counts as "not requested".
    pub async fn is_cancellation_requested(&self) -> bool {
        match self.jobs.is_cancel_requested(self.id).await {
            Ok(requested) => requested,
            Err(err) => {
                warn!(job_id = %self.id, error = ?err, "Could not read cancellation flag");
                false
            }
        }
    }

    /// Cancellation checkpoint for pipelines.
    pub async fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_cancellation_requested().await {
            debug!(job_id = %self.id, "Cancellation observed at checkpoint");
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    /// Waits until every status update sent so far has been written.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.send(StatusUpdate::Flush(done));
        let _ = wait.await;
    }

    fn send(&self, update: StatusUpdate) {
        if self.updates.send(update).is_err() {
            warn!(job_id = %self.id, "Status writer gone, dropping update");
        }
    }
}
