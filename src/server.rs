use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Error, Result};
use tokio::sync::mpsc;
use tokio::time::{sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use crate::controller::JobController;
use crate::error::JobError;
use crate::worker::{self, JobOutput, Services, WorkMessage};
use crate::{Job, JobRequest};

const TERMINAL_WRITE_ATTEMPTS: u32 = 5;
const TERMINAL_WRITE_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum ClientRequest {
    Submit(JobRequest),
    Cancel(Uuid),
}

#[derive(Debug)]
pub enum WorkResponseMessage {
    JobSubmitted(Uuid),
    JobCompleted(Uuid, Uuid),
    JobFailed(Uuid, String),
    CancelRequested(Uuid, bool),
    StoreError(Error),
}

/// Writes a job's terminal state, retrying with backoff. Only the public
/// message of a failure reaches the job row; the full error is logged.
pub async fn settle(
    controller: &JobController,
    job_id: Uuid,
    outcome: &Result<JobOutput, JobError>,
) -> Result<()> {
    let mut delay = TERMINAL_WRITE_BACKOFF;
    let mut attempt = 1;
    loop {
        let result = match outcome {
            Ok(output) => {
                controller
                    .complete_with_result(job_id, output.result_ref, &output.message)
                    .await
            }
            Err(err) => {
                controller
                    .fail_with(job_id, &format!("{err:?}"), Some(&err.public_message()))
                    .await
            }
        };
        match result {
            Ok(()) => return Ok(()),
            Err(err) if attempt < TERMINAL_WRITE_ATTEMPTS => {
                warn!(job_id = %job_id, attempt, error = ?err, "Terminal status write failed, retrying");
                sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

pub async fn serve(
    cancel_token: CancellationToken,
    services: Services,
    workers_count: u16,
    mut recv_from_client: mpsc::UnboundedReceiver<ClientRequest>,
    send_to_client: mpsc::UnboundedSender<WorkResponseMessage>,
) -> Result<(), Error> {
    let controller = JobController::new(services.jobs.clone());
    let (send_to_server, mut recv_from_worker) = mpsc::unbounded_channel::<WorkMessage>();
    let (send_to_queue, recv_from_queue) = async_channel::bounded::<Job>(workers_count as usize);

    let mut workers = vec![];
    for _ in 0..workers_count {
        let send_to_server = send_to_server.clone();
        let cancel_token = cancel_token.clone();
        let recv_from_queue = recv_from_queue.clone();
        let services = services.clone();
        let join_handle = tokio::spawn(
            async move {
                worker::start(cancel_token, services, recv_from_queue, send_to_server).await;
            }
            .instrument(info_span!("worker")),
        );
        workers.push(join_handle);
    }
    drop(send_to_server);

    // Jobs a previous process left in flight go back to the queue.
    let reset = services.jobs.reset_processing_jobs().await?;
    if reset > 0 {
        info!(count = reset, "Requeued interrupted jobs");
    }

    let mut in_flight: HashSet<Uuid> = HashSet::new();
    let mut poll = tokio::time::interval(services.config.poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Server cancelled");
                break;
            },
            _ = poll.tick() => {
                let free = (workers_count as usize).saturating_sub(in_flight.len());
                if free == 0 {
                    continue;
                }
                let queued = match services.jobs.queued_jobs(free + in_flight.len()).await {
                    Ok(queued) => queued,
                    Err(err) => {
                        error!(error = ?err, "Could not poll queued jobs");
                        notify(&send_to_client, WorkResponseMessage::StoreError(err));
                        continue;
                    }
                };
                let picked: Vec<Job> = queued
                    .into_iter()
                    .filter(|job| !in_flight.contains(&job.id))
                    .take(free)
                    .collect();
                for job in picked {
                    in_flight.insert(job.id);
                    send_to_queue.send(job).await?;
                }
            },
            chan_msg = recv_from_worker.recv() => {
                let Some(message) = chan_msg else {
                    debug!("Worker channel closed unexpectedly, exiting");
                    cancel_token.cancel();
                    break;
                };
                handle_work_message(&controller, message, &mut in_flight, &send_to_client).await;
            },
            chan_msg = recv_from_client.recv() => {
                let Some(request) = chan_msg else {
                    debug!("Client channel closed, exiting");
                    cancel_token.cancel();
                    break;
                };
                handle_client_request(&services, request, &send_to_client).await;
            },
        }
    }

    // Workers finish the job in hand; their outcomes still get written.
    send_to_queue.close();
    while let Some(message) = recv_from_worker.recv().await {
        handle_work_message(&controller, message, &mut in_flight, &send_to_client).await;
    }

    futures::future::join_all(workers)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;

    info!("Server stopped.");

    Ok(())
}

fn notify(send_to_client: &mpsc::UnboundedSender<WorkResponseMessage>, message: WorkResponseMessage) {
    if let Err(err) = send_to_client.send(message) {
        debug!(message = "Client is not listening", error = ?err);
    }
}

async fn handle_work_message(
    controller: &JobController,
    message: WorkMessage,
    in_flight: &mut HashSet<Uuid>,
    send_to_client: &mpsc::UnboundedSender<WorkResponseMessage>,
) {
    let (job_id, outcome) = match message {
        WorkMessage::JobStarted(job_id) => {
            debug!(message = "Starting job", job_id = %job_id);
            return;
        }
        WorkMessage::JobCompleted(job_id, output) => (job_id, Ok(output)),
        WorkMessage::JobFailed(job_id, err) => (job_id, Err(err)),
    };
    in_flight.remove(&job_id);

    if let Err(err) = settle(controller, job_id, &outcome).await {
        error!(job_id = %job_id, error = ?err, "Giving up on terminal status write");
        notify(send_to_client, WorkResponseMessage::StoreError(err));
        return;
    }
    let response = match outcome {
        Ok(output) => WorkResponseMessage::JobCompleted(job_id, output.result_ref),
        Err(err) => WorkResponseMessage::JobFailed(job_id, err.public_message()),
    };
    notify(send_to_client, response);
}

async fn handle_client_request(
    services: &Services,
    request: ClientRequest,
    send_to_client: &mpsc::UnboundedSender<WorkResponseMessage>,
) {
    let response = match request {
        ClientRequest::Submit(job_request) => {
            debug!(message = "Requested job", job_request = ?job_request);
            match Job::queued(&job_request) {
                Ok(job) => match services.jobs.create_job(&job).await {
                    Ok(()) => WorkResponseMessage::JobSubmitted(job.id),
                    Err(err) => WorkResponseMessage::StoreError(err),
                },
                Err(err) => WorkResponseMessage::StoreError(err.into()),
            }
        }
        ClientRequest::Cancel(job_id) => match services.jobs.request_cancel(job_id).await {
            Ok(accepted) => WorkResponseMessage::CancelRequested(job_id, accepted),
            Err(err) => WorkResponseMessage::StoreError(err),
        },
    };
    notify(send_to_client, response);
}
