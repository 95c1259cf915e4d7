//! Snapshot scrape: a paid provider run under a hard cost ceiling.
//!
//! The budget is settled before anything is spent. While the provider runs,
//! its live metrics are persisted through [`throttle::MetricsThrottle`] and
//! the job's cancellation flag is polled and forwarded to the provider as a
//! [`CancellationToken`]. Results are saved as a snapshot, remote media is
//! re-hosted, and on failure or cancellation the snapshot is discarded.

pub mod apify;
pub mod budget;
pub mod fetch;
pub mod provider;
pub mod throttle;

use std::collections::BTreeSet;
use std::time::Instant;

use anyhow::anyhow;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::*;
use uuid::Uuid;

use self::budget::Usd;
use self::fetch::Fetched;
use self::provider::{ProviderUpdate, RunOutcome, ScrapeOutput, ScrapeParams};
use self::throttle::MetricsThrottle;
use crate::cleanup;
use crate::controller::JobContext;
use crate::error::JobError;
use crate::media::{self, MediaUpload, Stored};
use crate::payload::JobPayload;
use crate::snapshot::{MediaCategory, Snapshot, SnapshotSource};
use crate::store::ProfileRef;
use crate::worker::{JobOutput, Services};
use crate::{Job, ScrapeRequest};

const SCRAPE_PROGRESS: (i64, i64) = (10, 70);
const MEDIA_PROGRESS: (i64, i64) = (78, 90);

#[instrument(skip_all, fields(job_id = %job.id, username = %request.username))]
pub async fn run(
    services: &Services,
    ctx: &JobContext,
    job: &Job,
    request: &ScrapeRequest,
) -> Result<JobOutput, JobError> {
    let mut artifact = None;
    match scrape(services, ctx, job, request, &mut artifact).await {
        Ok(output) => Ok(output),
        Err(err) => Err(cleanup::abandon(services, ctx, artifact, err).await),
    }
}

fn enter(ctx: &JobContext, phase: &str, progress: i64, message: &str) {
    ctx.merge_payload(&JobPayload::phase(phase));
    ctx.report_progress(progress, message);
}

/// First instant of the calendar month `now` falls in.
pub fn month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
        .single()
        .unwrap_or(now)
}

async fn scrape(
    services: &Services,
    ctx: &JobContext,
    job: &Job,
    request: &ScrapeRequest,
    artifact: &mut Option<Uuid>,
) -> Result<JobOutput, JobError> {
    ctx.start_processing("Starting your snapshot");
    discard_stale_artifact(services, ctx, job).await?;

    ctx.checkpoint().await?;
    enter(ctx, "budgeting", 5, "Checking your snapshot budget");
    let spent = services
        .jobs
        .spent_since(job.owner_id, month_start(Utc::now()))
        .await?;
    let plan = budget::plan(request, &services.config.budget, spent)?;
    ctx.merge_payload(&JobPayload {
        budget: Some(plan.clone()),
        ..Default::default()
    });
    info!(
        budget = %plan.effective_run_budget,
        timeline_count = ?plan.timeline_count,
        social_max_items = ?plan.social_max_items,
        "Snapshot budget settled"
    );
    let params = ScrapeParams {
        username: request.username.trim().to_string(),
        categories: request.categories.clone(),
        timeline_count: plan.timeline_count,
        timeline_budget: plan.timeline_estimate,
        social_max_items: plan.social_max_items,
        social_budget: plan.social_budget.unwrap_or(Usd::ZERO),
    };

    ctx.checkpoint().await?;
    enter(ctx, "starting", SCRAPE_PROGRESS.0, "Starting the scrape");
    let output = run_provider(services, ctx, job, &params).await?;
    record_spend(services, job, output.cost).await?;
    ctx.merge_payload(&JobPayload {
        accrued_cost: Some(output.cost),
        run_ids: Some(output.run_ids.clone()).filter(|ids| !ids.is_empty()),
        ..Default::default()
    });

    ctx.checkpoint().await?;
    let partial = match &output.outcome {
        RunOutcome::Succeeded => false,
        outcome if output.item_count() == 0 => {
            return Err(JobError::External(anyhow!(
                "Scrape run ended ({outcome:?}) without returning any items"
            )));
        }
        RunOutcome::Failed(reason) => {
            warn!(reason = %reason, items = output.item_count(), "Scrape run ended early, keeping partial results");
            true
        }
        RunOutcome::Aborted => true,
    };

    enter(ctx, "saving-record", 75, "Saving your snapshot");
    let counts = output.counts();
    let mut snapshot = Snapshot::new(job.owner_id, job.id, SnapshotSource::Scrape);
    absorb(&mut snapshot, output);
    services.snapshots.insert_snapshot(&snapshot).await?;
    *artifact = Some(snapshot.id);
    ctx.merge_payload(&JobPayload {
        artifact_id: Some(snapshot.id),
        counts: Some(counts),
        partial: Some(partial),
        ..Default::default()
    });

    ctx.checkpoint().await?;
    enter(ctx, "fetching-media", MEDIA_PROGRESS.0, "Saving media");
    fetch_media(services, ctx, &snapshot).await?;
    let records = services.snapshots.list_media(snapshot.id).await?;
    let rewritten = media::rewrite_references(&mut snapshot, &records, &services.config.media_url_prefix);
    debug!(rewritten, "Media references rewritten");

    ctx.checkpoint().await?;
    enter(ctx, "finalizing", 95, "Finalizing your snapshot");
    let footprint = media::recompute_footprint(&*services.snapshots, snapshot.id).await?;
    snapshot.refresh_counts();
    snapshot.stats.media_files = footprint.files;
    snapshot.stats.media_bytes = footprint.bytes;
    snapshot.storage_bytes = footprint.bytes;
    services.snapshots.update_snapshot(&snapshot).await?;
    if let Some(profile) = &snapshot.profile {
        services
            .snapshots
            .upsert_profile(&ProfileRef {
                owner_id: snapshot.owner_id,
                username: profile.username.clone(),
                display_name: profile.display_name.clone(),
                latest_snapshot_id: snapshot.id,
                updated_at: Utc::now(),
            })
            .await?;
    }

    let message = if partial {
        "Your snapshot is ready, but the scrape ended early so some items may be missing"
    } else {
        "Your snapshot is ready"
    };
    ctx.merge_payload(&JobPayload {
        phase: Some("completed".into()),
        media_bytes: Some(footprint.bytes),
        ..Default::default()
    });
    ctx.report_progress(100, message);
    Ok(JobOutput {
        result_ref: snapshot.id,
        message: message.to_string(),
    })
}

/// A snapshot left by an interrupted earlier run of this job is removed
/// before the scrape starts over.
async fn discard_stale_artifact(services: &Services, ctx: &JobContext, job: &Job) -> Result<(), JobError> {
    let Some(stale) = JobPayload::from_stored(&job.payload).artifact_id else {
        return Ok(());
    };
    let owned = services
        .snapshots
        .get_snapshot(stale)
        .await?
        .is_some_and(|snapshot| snapshot.job_id == job.id);
    if owned {
        warn!(snapshot_id = %stale, "Discarding snapshot of an interrupted run");
        cleanup::discard_snapshot(&*services.snapshots, &*services.blobs, stale).await?;
    }
    ctx.merge_payload_value(json!({ "artifact_id": null, "partial": null }));
    Ok(())
}

async fn record_spend(services: &Services, job: &Job, cost: Usd) -> Result<(), JobError> {
    if cost > Usd::ZERO {
        services.jobs.record_spend(job.owner_id, job.id, cost).await?;
    }
    Ok(())
}

/// Runs the provider while persisting its metrics and forwarding a
/// cancellation request to it. When the provider errors, the cost it last
/// reported is still charged to the owner's month.
async fn run_provider(
    services: &Services,
    ctx: &JobContext,
    job: &Job,
    params: &ScrapeParams,
) -> Result<ScrapeOutput, JobError> {
    let (updates_tx, mut updates) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let call = services.provider.run_scrape(params, updates_tx, cancel.clone());
    tokio::pin!(call);

    let mut throttle = MetricsThrottle::new(services.config.throttle.clone());
    let mut poll = tokio::time::interval(services.config.cancel_poll_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let requested = params.requested_items().max(1);
    let mut latest: Option<ProviderUpdate> = None;

    let result = loop {
        tokio::select! {
            result = &mut call => break result,
            Some(update) = updates.recv() => {
                if throttle.admit(&update, Instant::now()) {
                    publish(ctx, &update, requested);
                }
                latest = Some(update);
            },
            _ = poll.tick() => {
                if !cancel.is_cancelled() && ctx.is_cancellation_requested().await {
                    info!("Cancellation requested, stopping the provider run");
                    cancel.cancel();
                }
                if let Some(update) = &latest {
                    if throttle.admit(update, Instant::now()) {
                        publish(ctx, update, requested);
                    }
                }
            },
        }
    };

    while let Ok(update) = updates.try_recv() {
        latest = Some(update);
    }
    if let Some(update) = &latest {
        publish(ctx, update, requested);
    }
    match result {
        Ok(output) => Ok(output),
        Err(err) => {
            let accrued = latest.map_or(Usd::ZERO, |update| update.accrued_cost);
            if let Err(spend_err) = record_spend(services, job, accrued).await {
                error!(error = ?spend_err, cost = %accrued, "Could not record spend of a failed scrape");
            }
            Err(err.into())
        }
    }
}

fn publish(ctx: &JobContext, update: &ProviderUpdate, requested: u64) {
    let fetched = update.items().min(requested);
    let (start, end) = SCRAPE_PROGRESS;
    ctx.merge_payload(&JobPayload {
        phase: Some(update.phase.clone()),
        counts: Some(update.counts.clone()),
        accrued_cost: Some(update.accrued_cost),
        run_ids: Some(update.run_ids.clone()).filter(|ids| !ids.is_empty()),
        ..Default::default()
    });
    ctx.report_progress(
        start + (end - start) * fetched as i64 / requested as i64,
        &format!("Fetched {fetched} items"),
    );
}

fn absorb(snapshot: &mut Snapshot, output: ScrapeOutput) {
    snapshot.profile = output.profile;
    snapshot.posts = output.posts;
    snapshot.replies = output.replies;
    snapshot.followers = output.followers;
    snapshot.following = output.following;
    snapshot.refresh_counts();
}

/// Name a remote media object is stored under: `<post id>-<last segment>`,
/// taking the extension from a `format=` query when the path has none.
fn remote_file_name(post_id: &str, url: &str) -> String {
    let (path, query) = url.split_once('?').unwrap_or((url, ""));
    let name = path.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or("media");
    let format = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("format="))
        .filter(|_| !name.contains('.'));
    match format {
        Some(ext) => format!("{post_id}-{name}.{ext}"),
        None => format!("{post_id}-{name}"),
    }
}

#[derive(Debug, Default)]
struct FetchTotals {
    created: u64,
    already_present: u64,
    skipped: u64,
    bytes: u64,
}

/// Re-hosts the media referenced by scraped posts, one fetch at a time.
/// Objects over a ceiling or that cannot be fetched are skipped.
async fn fetch_media(services: &Services, ctx: &JobContext, snapshot: &Snapshot) -> Result<(), JobError> {
    let limits = &services.config.limits;
    let mut seen = BTreeSet::new();
    let wanted: Vec<(&str, &str)> = snapshot
        .posts
        .iter()
        .chain(snapshot.replies.iter())
        .flat_map(|post| post.media.iter().map(move |m| (post.id.as_str(), m.url.as_str())))
        .filter(|(_, url)| url.starts_with("http://") || url.starts_with("https://"))
        .filter(|(_, url)| seen.insert(*url))
        .collect();
    let total = wanted.len();
    ctx.merge_payload(&JobPayload {
        media_total: Some(total as u64),
        ..Default::default()
    });

    let mut totals = FetchTotals::default();
    for (done, (post_id, url)) in wanted.into_iter().enumerate() {
        if totals.created + totals.already_present >= limits.max_media_files as u64 {
            warn!(remaining = total - done, "Media file ceiling reached, skipping the rest");
            totals.skipped += (total - done) as u64;
            break;
        }
        ctx.checkpoint().await?;

        let upload = MediaUpload {
            snapshot_id: snapshot.id,
            owner_id: snapshot.owner_id,
            category: MediaCategory::Post,
            folder: None,
            file_name: remote_file_name(post_id, url),
            tweet_id: Some(post_id.to_string()),
            conversation_id: None,
        };
        if services.snapshots.media_exists(snapshot.id, &upload.path()).await? {
            totals.already_present += 1;
        } else {
            match services.fetcher.fetch(url, limits.max_media_entry_bytes).await {
                Ok(Fetched::Bytes(bytes)) if totals.bytes + bytes.len() as u64 > limits.max_total_media_bytes => {
                    warn!(url, "Total media ceiling reached, skipping");
                    totals.skipped += 1;
                }
                Ok(Fetched::Bytes(bytes)) => {
                    let size = bytes.len() as u64;
                    match media::store_media(&*services.snapshots, &*services.blobs, &upload, bytes).await? {
                        Stored::Created { .. } => {
                            totals.created += 1;
                            totals.bytes += size;
                        }
                        Stored::AlreadyPresent { .. } => totals.already_present += 1,
                    }
                }
                Ok(Fetched::TooLarge { observed }) => {
                    warn!(url, observed, "Media over the per-file ceiling, skipping");
                    totals.skipped += 1;
                }
                Err(err) => {
                    warn!(url, error = ?err, "Could not fetch media, skipping");
                    totals.skipped += 1;
                }
            }
        }

        let processed = done + 1;
        let (start, end) = MEDIA_PROGRESS;
        ctx.report_progress(
            start + (end - start) * processed as i64 / total as i64,
            &format!("Saving media {processed} of {total}"),
        );
    }

    ctx.merge_payload(&JobPayload {
        media_processed: Some(totals.created + totals.already_present),
        media_skipped: Some(totals.skipped),
        ..Default::default()
    });
    debug!(?totals, "Remote media fetched");
    Ok(())
}
