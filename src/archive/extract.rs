//! Media entries of an export: planning against the ceilings, then
//! streaming them into blob storage one at a time.

use std::collections::HashMap;

use tracing::debug;

use super::reader::{ArchiveReader, EntryInfo};
use crate::config::IngestLimits;
use crate::controller::JobContext;
use crate::error::{JobError, ResourceLimit};
use crate::media::{self, MediaUpload, Stored};
use crate::payload::JobPayload;
use crate::snapshot::{MediaCategory, Snapshot};
use crate::worker::Services;

const MEDIA_FOLDERS: &[(&str, MediaCategory)] = &[
    ("tweets_media", MediaCategory::Post),
    ("tweet_media", MediaCategory::Post),
    ("community_tweet_media", MediaCategory::Post),
    ("direct_messages_media", MediaCategory::DirectMessage),
    ("direct_messages_group_media", MediaCategory::DirectMessage),
    ("profile_media", MediaCategory::Profile),
];

const PAYLOAD_EVERY: usize = 25;

#[derive(Debug, Clone)]
pub struct MediaEntry {
    pub entry: EntryInfo,
    pub category: MediaCategory,
}

pub fn media_category(entry: &EntryInfo) -> Option<MediaCategory> {
    let file_name = entry.file_name();
    if entry.is_dir || file_name.is_empty() || file_name.starts_with('.') {
        return None;
    }
    let mut folders = entry.name.split('/').rev().skip(1);
    folders.find_map(|folder| {
        MEDIA_FOLDERS
            .iter()
            .find(|(name, _)| *name == folder)
            .map(|(_, category)| *category)
    })
}

/// Selects the media entries and checks every ceiling against the declared
/// sizes, before any entry is read.
pub fn plan_media(entries: &[EntryInfo], limits: &IngestLimits) -> Result<Vec<MediaEntry>, JobError> {
    let plan: Vec<MediaEntry> = entries
        .iter()
        .filter_map(|entry| {
            media_category(entry).map(|category| MediaEntry {
                entry: entry.clone(),
                category,
            })
        })
        .collect();

    // One more record is kept for the original archive.
    let records = plan.len() as u64 + 1;
    if records > limits.max_media_files as u64 {
        return Err(JobError::limit(
            ResourceLimit::MediaFiles,
            records,
            limits.max_media_files as u64,
        ));
    }
    let mut total: u64 = 0;
    for item in &plan {
        if item.entry.size > limits.max_media_entry_bytes {
            return Err(JobError::limit(
                ResourceLimit::MediaEntrySize,
                item.entry.size,
                limits.max_media_entry_bytes,
            ));
        }
        total = total.saturating_add(item.entry.size);
    }
    if total > limits.max_total_media_bytes {
        return Err(JobError::limit(
            ResourceLimit::MediaTotalSize,
            total,
            limits.max_total_media_bytes,
        ));
    }
    Ok(plan)
}

/// Leading id of an export media file name (`<id>-<name>`).
fn owner_prefix(file_name: &str) -> Option<&str> {
    let (prefix, _) = file_name.split_once('-')?;
    (!prefix.is_empty() && prefix.bytes().all(|b| b.is_ascii_digit())).then_some(prefix)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionTotals {
    pub created: u64,
    pub already_present: u64,
    pub bytes: u64,
}

/// Streams the planned entries into storage, mapping progress onto
/// `start..=end`.
pub async fn extract_media(
    services: &Services,
    ctx: &JobContext,
    reader: &ArchiveReader,
    plan: &[MediaEntry],
    snapshot: &Snapshot,
    conversations: &HashMap<String, String>,
    (start, end): (i64, i64),
) -> Result<ExtractionTotals, JobError> {
    let limits = &services.config.limits;
    let total = plan.len();
    let mut totals = ExtractionTotals::default();

    for (done, item) in plan.iter().enumerate() {
        ctx.checkpoint().await?;

        let file_name = item.entry.file_name().to_string();
        let prefix = owner_prefix(&file_name).map(str::to_string);
        let upload = MediaUpload {
            snapshot_id: snapshot.id,
            owner_id: snapshot.owner_id,
            category: item.category,
            folder: item.entry.folder().map(str::to_string),
            tweet_id: prefix.clone().filter(|_| item.category == MediaCategory::Post),
            conversation_id: prefix
                .filter(|_| item.category == MediaCategory::DirectMessage)
                .and_then(|message_id| conversations.get(&message_id).cloned()),
            file_name,
        };

        let bytes = reader
            .read_limited(&item.entry, limits.max_media_entry_bytes, ResourceLimit::MediaEntrySize)
            .await?;
        let size = bytes.len() as u64;
        if totals.bytes + size > limits.max_total_media_bytes {
            return Err(JobError::limit(
                ResourceLimit::MediaTotalSize,
                totals.bytes + size,
                limits.max_total_media_bytes,
            ));
        }
        match media::store_media(&*services.snapshots, &*services.blobs, &upload, bytes).await? {
            Stored::Created { .. } => {
                totals.created += 1;
                totals.bytes += size;
            }
            Stored::AlreadyPresent { .. } => totals.already_present += 1,
        }

        let processed = done + 1;
        ctx.report_progress(
            start + (end - start) * processed as i64 / total as i64,
            &format!("Uploading media {processed} of {total}"),
        );
        if processed % PAYLOAD_EVERY == 0 || processed == total {
            ctx.merge_payload(&JobPayload {
                media_processed: Some(processed as u64),
                ..Default::default()
            });
        }
    }

    debug!(?totals, "Media extraction finished");
    Ok(totals)
}
