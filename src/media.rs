//! Re-hosting media objects for an artifact.

use std::collections::HashMap;
use std::path::Path;

use anyhow::anyhow;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::blob::BlobStorage;
use crate::error::JobError;
use crate::snapshot::{MediaCategory, Snapshot};
use crate::store::{MediaRecord, SnapshotStore, OPTIONAL_MEDIA_COLUMNS};
use crate::tolerant;

/// One object about to be attached to an artifact.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub snapshot_id: Uuid,
    pub owner_id: Uuid,
    pub category: MediaCategory,
    /// Folder the object came from, kept in the path so equal names from
    /// different folders stay apart.
    pub folder: Option<String>,
    pub file_name: String,
    pub tweet_id: Option<String>,
    pub conversation_id: Option<String>,
}

impl MediaUpload {
    /// Storage path, namespaced by owner and category.
    pub fn path(&self) -> String {
        let mut path = format!("{}/{}/{}/", self.owner_id, self.category, self.snapshot_id);
        if let Some(folder) = &self.folder {
            path.push_str(&sanitize_file_name(folder));
            path.push('/');
        }
        path.push_str(&sanitize_file_name(&self.file_name));
        path
    }

    fn record(&self, path: String, size_bytes: u64, mime_type: String) -> MediaRecord {
        MediaRecord {
            id: Uuid::new_v4(),
            snapshot_id: self.snapshot_id,
            owner_id: self.owner_id,
            path,
            size_bytes,
            mime_type,
            category: self.category,
            tweet_id: self.tweet_id.clone(),
            original_filename: Some(self.file_name.clone()),
            conversation_id: self.conversation_id.clone(),
            created_at: Utc::now(),
        }
    }
}

/// What happened to one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stored {
    Created { path: String, size: u64 },
    /// A previous run already recorded this path.
    AlreadyPresent { path: String },
}

fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

pub fn mime_type_of(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Uploads `bytes` and records them, unless the path is already recorded
/// for this artifact.
pub async fn store_media(
    snapshots: &dyn SnapshotStore,
    blobs: &dyn BlobStorage,
    upload: &MediaUpload,
    bytes: Vec<u8>,
) -> Result<Stored, JobError> {
    let path = upload.path();
    if snapshots.media_exists(upload.snapshot_id, &path).await? {
        debug!(path = %path, "Media already recorded, skipping");
        return Ok(Stored::AlreadyPresent { path });
    }
    let size = bytes.len() as u64;
    let mime_type = mime_type_of(&upload.file_name);
    blobs.put(&path, bytes, &mime_type).await?;
    let record = upload.record(path.clone(), size, mime_type);
    insert_record(snapshots, &record).await?;
    Ok(Stored::Created { path, size })
}

/// Copies a local file into blob storage and records it, unless the path is
/// already recorded for this artifact. Returns the id of the media row.
pub async fn store_media_file(
    snapshots: &dyn SnapshotStore,
    blobs: &dyn BlobStorage,
    upload: &MediaUpload,
    source: &Path,
) -> Result<Uuid, JobError> {
    let path = upload.path();
    if let Some(existing) = snapshots
        .list_media(upload.snapshot_id)
        .await?
        .into_iter()
        .find(|m| m.path == path)
    {
        return Ok(existing.id);
    }
    let mime_type = mime_type_of(&upload.file_name);
    let size = blobs.upload_file(&path, source, &mime_type).await?;
    let record = upload.record(path, size, mime_type);
    insert_record(snapshots, &record).await?;
    Ok(record.id)
}

async fn insert_record(snapshots: &dyn SnapshotStore, record: &MediaRecord) -> Result<(), JobError> {
    tolerant::insert_media_row(snapshots, record.to_row(), OPTIONAL_MEDIA_COLUMNS)
        .await
        .map_err(|err| JobError::External(anyhow!("recording media {}: {err}", record.path)))
}

pub fn media_url(prefix: &str, path: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), path)
}

/// Last path segment of a URL or path, without query or fragment.
fn reference_name(reference: &str) -> &str {
    let end = reference.find(['?', '#']).unwrap_or(reference.len());
    let reference = &reference[..end];
    reference.rsplit('/').next().unwrap_or(reference)
}

fn stem(name: &str) -> Option<&str> {
    name.rsplit_once('.').map(|(stem, _)| stem).filter(|s| !s.is_empty())
}

/// Points media references at the re-hosted copies.
///
/// Stored files are named `<owner id>-<original name>`, while records refer
/// to the original name, so both the full name and the part after the first
/// `-` are matched, and extension-less references match by stem. Returns
/// the number of references rewritten.
pub fn rewrite_references(snapshot: &mut Snapshot, media: &[MediaRecord], url_prefix: &str) -> usize {
    let mut by_name: HashMap<String, String> = HashMap::new();
    for record in media.iter().filter(|m| m.category != MediaCategory::Archive) {
        let name = record
            .original_filename
            .clone()
            .unwrap_or_else(|| record.file_name().to_string());
        let url = media_url(url_prefix, &record.path);
        let rest = name.split_once('-').map(|(_, rest)| rest);
        for alias in [rest, rest.and_then(stem), stem(&name)].into_iter().flatten() {
            by_name.entry(alias.to_string()).or_insert_with(|| url.clone());
        }
        by_name.insert(name, url);
    }

    let mut rewritten = 0;
    let mut rewrite = |reference: &mut String| {
        if let Some(url) = by_name.get(reference_name(reference)) {
            *reference = url.clone();
            rewritten += 1;
        }
    };
    for post in snapshot.posts.iter_mut().chain(snapshot.replies.iter_mut()) {
        for media_ref in &mut post.media {
            rewrite(&mut media_ref.url);
        }
    }
    for message in &mut snapshot.direct_messages {
        for url in &mut message.media_urls {
            rewrite(url);
        }
    }
    rewritten
}

/// Storage footprint of an artifact, recomputed from its media records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Footprint {
    pub files: u64,
    pub bytes: u64,
}

pub async fn recompute_footprint(
    snapshots: &dyn SnapshotStore,
    snapshot_id: Uuid,
) -> Result<Footprint, JobError> {
    let media = snapshots.list_media(snapshot_id).await?;
    let footprint = Footprint {
        files: media.len() as u64,
        bytes: media.iter().map(|m| m.size_bytes).sum(),
    };
    snapshots.set_storage_bytes(snapshot_id, footprint.bytes).await?;
    Ok(footprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStorage;
    use crate::snapshot::{DirectMessage, MediaRef, Post, SnapshotSource};
    use crate::store::MemorySnapshotStore;

    fn upload(snapshot_id: Uuid, file_name: &str) -> MediaUpload {
        MediaUpload {
            snapshot_id,
            owner_id: Uuid::nil(),
            category: MediaCategory::Post,
            folder: None,
            file_name: file_name.into(),
            tweet_id: Some("10".into()),
            conversation_id: None,
        }
    }

    #[tokio::test]
    async fn second_store_of_same_path_is_skipped() {
        let snapshots = MemorySnapshotStore::new();
        let blobs = MemoryBlobStorage::new();
        let id = Uuid::new_v4();
        let item = upload(id, "10-abc.jpg");

        let first = store_media(&snapshots, &blobs, &item, vec![1, 2, 3]).await.unwrap();
        let second = store_media(&snapshots, &blobs, &item, vec![1, 2, 3]).await.unwrap();

        assert!(matches!(first, Stored::Created { size: 3, .. }));
        assert!(matches!(second, Stored::AlreadyPresent { .. }));
        assert_eq!(snapshots.list_media(id).await.unwrap().len(), 1);
        assert_eq!(blobs.content_type(&item.path()).as_deref(), Some("image/jpeg"));
    }

    #[tokio::test]
    async fn footprint_is_summed_from_records() {
        let snapshots = MemorySnapshotStore::new();
        let blobs = MemoryBlobStorage::new();
        let mut snapshot = Snapshot::new(Uuid::nil(), Uuid::new_v4(), SnapshotSource::Archive);
        snapshot.storage_bytes = 999;
        snapshots.insert_snapshot(&snapshot).await.unwrap();

        store_media(&snapshots, &blobs, &upload(snapshot.id, "a.jpg"), vec![0; 5]).await.unwrap();
        store_media(&snapshots, &blobs, &upload(snapshot.id, "b.png"), vec![0; 7]).await.unwrap();

        let footprint = recompute_footprint(&snapshots, snapshot.id).await.unwrap();
        assert_eq!(footprint, Footprint { files: 2, bytes: 12 });
        assert_eq!(snapshots.snapshot(snapshot.id).unwrap().storage_bytes, 12);
    }

    #[test]
    fn paths_are_namespaced_and_sanitized() {
        let item = MediaUpload {
            category: MediaCategory::DirectMessage,
            ..upload(Uuid::nil(), "../we ird.jpg")
        };
        let path = item.path();
        assert!(path.starts_with(&format!("{}/direct_message/", Uuid::nil())));
        assert!(path.ends_with("/_we_ird.jpg"));
    }

    #[test]
    fn folder_keeps_equal_names_apart() {
        let first = MediaUpload {
            folder: Some("data/tweets_media".into()),
            ..upload(Uuid::nil(), "10-a.jpg")
        };
        let second = MediaUpload {
            folder: Some("data/community_tweet_media".into()),
            ..first.clone()
        };
        assert_ne!(first.path(), second.path());
        assert!(first.path().ends_with("/data_tweets_media/10-a.jpg"));
    }

    #[test]
    fn references_are_rewritten_by_file_name() {
        let mut snapshot = Snapshot::new(Uuid::nil(), Uuid::new_v4(), SnapshotSource::Archive);
        snapshot.posts.push(Post {
            id: "10".into(),
            media: vec![
                MediaRef {
                    url: "https://pbs.twimg.com/media/AbC.jpg".into(),
                    kind: Some("photo".into()),
                },
                MediaRef {
                    url: "https://pbs.twimg.com/media/Missing.jpg".into(),
                    kind: None,
                },
            ],
            ..Default::default()
        });
        snapshot.direct_messages.push(DirectMessage {
            id: "100".into(),
            conversation_id: "1-2".into(),
            media_urls: vec!["https://ton.twitter.com/dm/100/5/Key.png?name=orig".into()],
            ..Default::default()
        });
        let records: Vec<MediaRecord> = [
            (MediaCategory::Post, "10-AbC.jpg"),
            (MediaCategory::DirectMessage, "100-Key.png"),
        ]
        .into_iter()
        .map(|(category, name)| {
            MediaUpload {
                category,
                ..upload(snapshot.id, name)
            }
            .record(format!("o/{category}/s/{name}"), 1, mime_type_of(name))
        })
        .collect();

        let rewritten = rewrite_references(&mut snapshot, &records, "/media/");

        assert_eq!(rewritten, 2);
        assert_eq!(snapshot.posts[0].media[0].url, "/media/o/post/s/10-AbC.jpg");
        assert_eq!(
            snapshot.posts[0].media[1].url,
            "https://pbs.twimg.com/media/Missing.jpg"
        );
        assert_eq!(
            snapshot.direct_messages[0].media_urls[0],
            "/media/o/direct_message/s/100-Key.png"
        );
    }

    #[test]
    fn extensionless_references_match_by_stem() {
        let mut snapshot = Snapshot::new(Uuid::nil(), Uuid::new_v4(), SnapshotSource::Scrape);
        snapshot.posts.push(Post {
            id: "10".into(),
            media: vec![MediaRef {
                url: "https://pbs.twimg.com/media/AbC?format=png&name=large".into(),
                kind: None,
            }],
            ..Default::default()
        });
        let record = upload(snapshot.id, "10-AbC.png").record("o/post/s/10-AbC.png".into(), 1, "image/png".into());

        assert_eq!(rewrite_references(&mut snapshot, &[record], "/media"), 1);
        assert_eq!(snapshot.posts[0].media[0].url, "/media/o/post/s/10-AbC.png");
    }
}
