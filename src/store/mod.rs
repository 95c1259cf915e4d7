//! Collaborator interfaces for the relational store.
//!
//! The engine never talks to a database directly; a process entry point
//! constructs one implementation (Postgres in [`crate::db`], in-memory in
//! [`memory`]) and threads it through the workers.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::InsertError;
use crate::scrape::budget::Usd;
use crate::snapshot::{MediaCategory, Snapshot};
use crate::Job;

pub mod memory;

pub use memory::{MemoryJobStore, MemorySnapshotStore};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// Oldest queued jobs first.
    async fn queued_jobs(&self, limit: usize) -> Result<Vec<Job>>;

    /// Puts jobs left in `processing` by a previous process back in the queue.
    async fn reset_processing_jobs(&self) -> Result<u64>;

    /// Moves a queued job to `processing`. Returns false when the job was
    /// not queued.
    async fn begin_job(&self, id: Uuid, progress: i16, message: &str) -> Result<bool>;

    async fn update_progress(&self, id: Uuid, progress: i16, message: &str) -> Result<()>;

    /// Deep-merges `patch` into the stored payload.
    async fn merge_payload(&self, id: Uuid, patch: Value) -> Result<()>;

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool>;

    /// Flags a job for cooperative cancellation. Returns false for unknown or
    /// finished jobs.
    async fn request_cancel(&self, id: Uuid) -> Result<bool>;

    async fn complete_job(&self, id: Uuid, result_ref: Uuid, message: &str) -> Result<()>;

    async fn fail_job(&self, id: Uuid, error_message: &str) -> Result<()>;

    async fn record_spend(&self, owner_id: Uuid, job_id: Uuid, cost: Usd) -> Result<()>;

    async fn spent_since(&self, owner_id: Uuid, since: DateTime<Utc>) -> Result<Usd>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    async fn get_snapshot(&self, id: Uuid) -> Result<Option<Snapshot>>;

    async fn delete_snapshot(&self, id: Uuid) -> Result<bool>;

    async fn set_storage_bytes(&self, id: Uuid, bytes: u64) -> Result<()>;

    async fn media_exists(&self, snapshot_id: Uuid, path: &str) -> Result<bool>;

    /// One raw insert attempt. Unknown columns must be reported as
    /// [`InsertError::UnknownColumn`] so the caller can retry without them.
    async fn insert_media_row(&self, row: &Map<String, Value>) -> Result<(), InsertError>;

    async fn list_media(&self, snapshot_id: Uuid) -> Result<Vec<MediaRecord>>;

    /// Removes every media row of a snapshot and returns the removed rows.
    async fn delete_media(&self, snapshot_id: Uuid) -> Result<Vec<MediaRecord>>;

    async fn upsert_profile(&self, profile: &ProfileRef) -> Result<()>;
}

/// Metadata row for one stored binary object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: Uuid,
    pub snapshot_id: Uuid,
    pub owner_id: Uuid,
    pub path: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub category: MediaCategory,
    #[serde(default)]
    pub tweet_id: Option<String>,
    #[serde(default)]
    pub original_filename: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Columns that older deployments of the media table may not have.
pub const OPTIONAL_MEDIA_COLUMNS: &[&str] = &["tweet_id", "original_filename", "conversation_id"];

impl MediaRecord {
    /// Column map for a raw insert. Absent optional values are left out.
    pub fn to_row(&self) -> Map<String, Value> {
        let mut row = match serde_json::to_value(self) {
            Ok(Value::Object(row)) => row,
            _ => Map::new(),
        };
        row.retain(|_, value| !value.is_null());
        row
    }

    pub fn from_row(row: &Map<String, Value>) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(row.clone()))?)
    }

    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// Denormalized pointer from an owner to their latest artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRef {
    pub owner_id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
    pub latest_snapshot_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_omits_absent_optional_columns() {
        let record = MediaRecord {
            id: Uuid::new_v4(),
            snapshot_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            path: "o/post/s/1-abc.jpg".into(),
            size_bytes: 12,
            mime_type: "image/jpeg".into(),
            category: MediaCategory::Post,
            tweet_id: None,
            original_filename: Some("1-abc.jpg".into()),
            conversation_id: None,
            created_at: Utc::now(),
        };
        let row = record.to_row();
        assert!(!row.contains_key("tweet_id"));
        assert_eq!(row["category"], "post");
        assert_eq!(MediaRecord::from_row(&row).unwrap(), record);
        assert_eq!(record.file_name(), "1-abc.jpg");
    }
}
