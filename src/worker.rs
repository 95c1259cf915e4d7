use std::sync::Arc;

use async_channel::Receiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::blob::BlobStorage;
use crate::config::EngineConfig;
use crate::controller::JobController;
use crate::error::JobError;
use crate::scrape::fetch::MediaFetcher;
use crate::scrape::provider::ScrapeProvider;
use crate::store::{JobStore, SnapshotStore};
use crate::{archive, scrape, Job, JobParams};

/// Collaborators a job runs against, built once by the entry point.
#[derive(Clone)]
pub struct Services {
    pub jobs: Arc<dyn JobStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub blobs: Arc<dyn BlobStorage>,
    pub provider: Arc<dyn ScrapeProvider>,
    pub fetcher: Arc<dyn MediaFetcher>,
    pub config: Arc<EngineConfig>,
}

/// What a successful run hands back for the terminal write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutput {
    pub result_ref: Uuid,
    pub message: String,
}

#[derive(Debug)]
pub enum WorkMessage {
    JobStarted(Uuid),
    JobCompleted(Uuid, JobOutput),
    JobFailed(Uuid, JobError),
}

pub async fn start(
    cancel_token: CancellationToken,
    services: Services,
    recv_from_queue: Receiver<Job>,
    send_to_server: UnboundedSender<WorkMessage>,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Worker cancelled");
                break;
            },
            job = recv_from_queue.recv() => {
                let job = match job {
                    Ok(job) => job,
                    Err(err) => {
                        error!(message = "Error receiving job by worker, exiting", error = ?err);
                        break;
                    }
                };
                let job_id = job.id;
                if send_to_server.send(WorkMessage::JobStarted(job_id)).is_err() {
                    error!(job_id = %job_id, "Server gone, worker exiting");
                    break;
                }
                let message = match process(&services, &job).await {
                    Ok(output) => WorkMessage::JobCompleted(job_id, output),
                    Err(err) => WorkMessage::JobFailed(job_id, err),
                };
                if send_to_server.send(message).is_err() {
                    error!(job_id = %job_id, "Server gone before the job outcome was delivered");
                    break;
                }
            }
        }
    }
    info!("Worker stopped.");
}

/// Runs one job to its outcome. Terminal status writes are left to the
/// caller; everything sent through the job's context is written before this
/// returns.
#[instrument(skip_all, fields(job_id = %job.id, kind = ?job.kind))]
pub async fn process(services: &Services, job: &Job) -> Result<JobOutput, JobError> {
    let ctx = JobController::new(services.jobs.clone()).context(job.id);
    let result = match job.params() {
        Ok(JobParams::ArchiveUpload(params)) => archive::run(services, &ctx, job, &params).await,
        Ok(JobParams::SnapshotScrape(request)) => scrape::run(services, &ctx, job, &request).await,
        Err(err) => Err(err),
    };
    ctx.flush().await;
    match &result {
        Ok(output) => info!(result_ref = %output.result_ref, "Job finished"),
        Err(err) if err.is_cancelled() => info!("Job cancelled"),
        Err(err) => warn!(error = %err, "Job failed"),
    }
    result
}
