use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod archive;
pub mod blob;
pub mod cleanup;
pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod media;
pub mod payload;
pub mod scrape;
pub mod server;
pub mod snapshot;
pub mod store;
pub mod telemetry;
pub mod tolerant;
pub mod worker;

pub use config::EngineConfig;
pub use controller::{JobContext, JobController};
pub use error::{JobError, CANCELLED_MESSAGE};
pub use payload::JobPayload;

/// A request to create a new job, as handed over by the request layer.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub owner_id: Uuid,
    pub params: JobParams,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub kind: JobKind,
    pub status: Status,
    pub progress: i16,
    pub message: String,
    pub params: serde_json::Value,
    pub payload: serde_json::Value,
    pub result_ref: Option<Uuid>,
    pub error_message: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Builds a fresh `queued` job for a request.
    pub fn queued(request: &JobRequest) -> Result<Self, serde_json::Error> {
        let now = Utc::now();
        Ok(Job {
            id: Uuid::new_v4(),
            owner_id: request.owner_id,
            kind: request.params.kind(),
            status: Status::Queued,
            progress: 0,
            message: "Queued".into(),
            params: serde_json::to_value(&request.params)?,
            payload: serde_json::Value::Object(Default::default()),
            result_ref: None,
            error_message: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Decodes the stored request parameters.
    pub fn params(&self) -> Result<JobParams, JobError> {
        serde_json::from_value(self.params.clone())
            .map_err(|err| JobError::Validation(format!("Invalid job parameters: {err}")))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, Status::Completed | Status::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "backup_job_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "backup_job_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ArchiveUpload,
    SnapshotScrape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobParams {
    ArchiveUpload(ArchiveParams),
    SnapshotScrape(ScrapeRequest),
}

impl JobParams {
    pub fn kind(&self) -> JobKind {
        match self {
            JobParams::ArchiveUpload(_) => JobKind::ArchiveUpload,
            JobParams::SnapshotScrape(_) => JobKind::SnapshotScrape,
        }
    }
}

/// Where the uploaded export archive already lives in blob storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveParams {
    pub blob_path: String,
    #[serde(default)]
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub username: String,
    pub categories: Vec<ScrapeCategory>,
    /// Requested number of timeline items. Kept as a raw JSON number so a
    /// fractional or negative value can be rejected instead of coerced.
    #[serde(default)]
    pub timeline_count: Option<serde_json::Number>,
}

impl ScrapeRequest {
    pub fn wants_timeline(&self) -> bool {
        self.categories.iter().any(|c| c.is_timeline())
    }

    pub fn wants_social_graph(&self) -> bool {
        self.categories.iter().any(|c| !c.is_timeline())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrapeCategory {
    Posts,
    Replies,
    Followers,
    Following,
}

impl ScrapeCategory {
    pub fn is_timeline(&self) -> bool {
        matches!(self, ScrapeCategory::Posts | ScrapeCategory::Replies)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScrapeCategory::Posts => "posts",
            ScrapeCategory::Replies => "replies",
            ScrapeCategory::Followers => "followers",
            ScrapeCategory::Following => "following",
        }
    }
}
