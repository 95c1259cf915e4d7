//! Archive ingestion: turns an uploaded export archive into a snapshot with
//! re-hosted media.
//!
//! Phases run strictly in order, each behind a cancellation checkpoint:
//! `downloading` → `extracting-metadata` → `parsing` → `saving-record` →
//! `uploading-media` → `finalizing`. Once the snapshot row exists, any
//! failure discards it together with its media.

pub mod categories;
pub mod extract;
pub mod normalize;
pub mod quirky;
pub mod reader;

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use serde_json::Value;
use tracing::*;
use uuid::Uuid;

use self::categories::ExportCategory;
use self::normalize::ParsedExport;
use self::reader::{ArchiveReader, EntryInfo};
use crate::cleanup;
use crate::controller::JobContext;
use crate::error::JobError;
use crate::media::{self, MediaUpload};
use crate::payload::JobPayload;
use crate::snapshot::{MediaCategory, Snapshot, SnapshotSource};
use crate::store::ProfileRef;
use crate::worker::{JobOutput, Services};
use crate::{ArchiveParams, Job};

const MEDIA_PROGRESS: (i64, i64) = (55, 85);
const DEFAULT_ARCHIVE_NAME: &str = "archive.zip";

#[instrument(skip_all, fields(job_id = %job.id))]
pub async fn run(
    services: &Services,
    ctx: &JobContext,
    job: &Job,
    params: &ArchiveParams,
) -> Result<JobOutput, JobError> {
    let mut artifact = None;
    match ingest(services, ctx, job, params, &mut artifact).await {
        Ok(snapshot_id) => Ok(JobOutput {
            result_ref: snapshot_id,
            message: "Your backup is ready".into(),
        }),
        Err(err) => Err(cleanup::abandon(services, ctx, artifact, err).await),
    }
}

fn enter(ctx: &JobContext, phase: &str, progress: i64, message: &str) {
    ctx.merge_payload(&JobPayload::phase(phase));
    ctx.report_progress(progress, message);
}

async fn ingest(
    services: &Services,
    ctx: &JobContext,
    job: &Job,
    params: &ArchiveParams,
    artifact: &mut Option<Uuid>,
) -> Result<Uuid, JobError> {
    let limits = &services.config.limits;
    ctx.start_processing("Starting your backup");

    ctx.checkpoint().await?;
    enter(ctx, "downloading", 5, "Downloading your archive");
    let workdir = tempfile::Builder::new().prefix("backupq-").tempdir()?;
    let local = workdir.path().join("export.zip");
    let archive_size = services
        .blobs
        .download_to(&params.blob_path, &local)
        .await?
        .ok_or_else(|| {
            JobError::Validation("The uploaded archive could not be found. Please upload it again.".into())
        })?;
    debug!(bytes = archive_size, "Archive downloaded");

    ctx.checkpoint().await?;
    enter(ctx, "extracting-metadata", 15, "Reading your archive");
    let reader = ArchiveReader::open(local.clone(), limits.max_archive_entries).await?;
    ctx.merge_payload(&JobPayload {
        archive_entries: Some(reader.entries().len() as u64),
        ..Default::default()
    });
    let (raw, skipped) = read_metadata(ctx, &reader, limits.max_metadata_file_bytes).await?;
    require_core_categories(&raw)?;

    ctx.checkpoint().await?;
    enter(ctx, "parsing", 30, "Organizing your posts");
    let parsed = normalize::normalize(raw);
    if parsed.profile.is_none() {
        return Err(JobError::InvalidExport("no account information found".into()));
    }
    ctx.merge_payload(&JobPayload {
        counts: Some(parsed.counts()),
        skipped_files: Some(skipped),
        ..Default::default()
    });
    let conversations: HashMap<String, String> = parsed
        .conversation_of_message()
        .into_iter()
        .map(|(message, conversation)| (message.to_string(), conversation.to_string()))
        .collect();

    ctx.checkpoint().await?;
    enter(ctx, "saving-record", 45, "Saving your backup");
    let mut snapshot = save_record(services, job, parsed).await?;
    *artifact = Some(snapshot.id);
    ctx.merge_payload(&JobPayload {
        artifact_id: Some(snapshot.id),
        ..Default::default()
    });

    ctx.checkpoint().await?;
    let plan = extract::plan_media(reader.entries(), limits)?;
    enter(
        ctx,
        "uploading-media",
        MEDIA_PROGRESS.0,
        &format!("Uploading {} media files", plan.len()),
    );
    ctx.merge_payload(&JobPayload {
        media_total: Some(plan.len() as u64),
        ..Default::default()
    });
    let totals = extract::extract_media(
        services,
        ctx,
        &reader,
        &plan,
        &snapshot,
        &conversations,
        MEDIA_PROGRESS,
    )
    .await?;
    info!(
        created = totals.created,
        already_present = totals.already_present,
        "Media uploaded"
    );

    ctx.checkpoint().await?;
    enter(ctx, "finalizing", 88, "Finalizing your backup");
    let archive = MediaUpload {
        snapshot_id: snapshot.id,
        owner_id: snapshot.owner_id,
        category: MediaCategory::Archive,
        folder: None,
        file_name: params
            .file_name
            .clone()
            .unwrap_or_else(|| DEFAULT_ARCHIVE_NAME.to_string()),
        tweet_id: None,
        conversation_id: None,
    };
    snapshot.archive_media_id =
        Some(media::store_media_file(&*services.snapshots, &*services.blobs, &archive, &local).await?);

    let records = services.snapshots.list_media(snapshot.id).await?;
    let rewritten = media::rewrite_references(&mut snapshot, &records, &services.config.media_url_prefix);
    debug!(rewritten, "Media references rewritten");

    let footprint = media::recompute_footprint(&*services.snapshots, snapshot.id).await?;
    snapshot.refresh_counts();
    snapshot.stats.media_files = footprint.files;
    snapshot.stats.media_bytes = footprint.bytes;
    snapshot.storage_bytes = footprint.bytes;
    services.snapshots.update_snapshot(&snapshot).await?;
    ctx.report_progress(95, "Finalizing your backup");

    // Exports with only a profile record carry no username to key on.
    if let Some(profile) = snapshot.profile.as_ref().filter(|p| !p.username.is_empty()) {
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

    ctx.merge_payload(&JobPayload {
        phase: Some("completed".into()),
        media_bytes: Some(footprint.bytes),
        ..Default::default()
    });
    ctx.report_progress(100, "Your backup is ready");
    Ok(snapshot.id)
}

/// Reads and extracts every metadata file of a known category. Files whose
/// content cannot be extracted are skipped and returned by name.
async fn read_metadata(
    ctx: &JobContext,
    reader: &ArchiveReader,
    max_file_bytes: u64,
) -> Result<(BTreeMap<ExportCategory, Vec<Value>>, Vec<String>), JobError> {
    let mut raw: BTreeMap<ExportCategory, Vec<Value>> = BTreeMap::new();
    let mut skipped = Vec::new();
    for (category, files) in categories::locate(reader.entries()) {
        for entry in files {
            ctx.checkpoint().await?;
            match read_metadata_file(reader, &entry, max_file_bytes).await? {
                Some(values) => raw.entry(category).or_default().extend(values),
                None => skipped.push(entry.name.clone()),
            }
        }
    }
    Ok((raw, skipped))
}

async fn read_metadata_file(
    reader: &ArchiveReader,
    entry: &EntryInfo,
    max_file_bytes: u64,
) -> Result<Option<Vec<Value>>, JobError> {
    let content = reader.read_to_string(entry, max_file_bytes).await?;
    match quirky::extract_records(&content) {
        Ok(values) => Ok(Some(values)),
        Err(err) => {
            warn!(file = %entry.name, error = %err, "Skipping unreadable metadata file");
            Ok(None)
        }
    }
}

fn require_core_categories(raw: &BTreeMap<ExportCategory, Vec<Value>>) -> Result<(), JobError> {
    let has_records = |category| raw.get(&category).is_some_and(|values| !values.is_empty());
    if !has_records(ExportCategory::Account) && !has_records(ExportCategory::Profile) {
        return Err(JobError::InvalidExport("no account information found".into()));
    }
    if !raw.contains_key(&ExportCategory::Posts) {
        return Err(JobError::InvalidExport("no posts found".into()));
    }
    Ok(())
}

/// Writes the snapshot row, reusing the one a previous run of the same job
/// left behind.
async fn save_record(services: &Services, job: &Job, parsed: ParsedExport) -> Result<Snapshot, JobError> {
    let previous = match JobPayload::from_stored(&job.payload).artifact_id {
        Some(id) => services
            .snapshots
            .get_snapshot(id)
            .await?
            .filter(|snapshot| snapshot.job_id == job.id),
        None => None,
    };
    let resumed = previous.is_some();
    let mut snapshot =
        previous.unwrap_or_else(|| Snapshot::new(job.owner_id, job.id, SnapshotSource::Archive));

    snapshot.profile = parsed.profile;
    snapshot.posts = parsed.posts;
    snapshot.replies = parsed.replies;
    snapshot.followers = parsed.followers;
    snapshot.following = parsed.following;
    snapshot.likes = parsed.likes;
    snapshot.direct_messages = parsed.direct_messages;
    snapshot.refresh_counts();

    if resumed {
        info!(snapshot_id = %snapshot.id, "Resuming into existing snapshot");
        services.snapshots.update_snapshot(&snapshot).await?;
    } else {
        services.snapshots.insert_snapshot(&snapshot).await?;
    }
    Ok(snapshot)
}
