use std::fmt;

use thiserror::Error;

/// Reserved message written when a job ends because its owner cancelled it.
/// The presentation layer matches on it to tell cancellation from failure.
pub const CANCELLED_MESSAGE: &str = "Backup cancelled by user";

/// Shown instead of internal detail for infrastructure failures.
pub const GENERIC_FAILURE_MESSAGE: &str =
    "Something went wrong while processing your backup. Please try again later.";

#[derive(Error, Debug)]
pub enum JobError {
    /// Bad or missing input, or a budget that cannot cover the request.
    #[error("{0}")]
    Validation(String),

    #[error("{limit} limit exceeded: {observed} > {max}")]
    ResourceLimit {
        limit: ResourceLimit,
        observed: u64,
        max: u64,
    },

    /// The upload parsed but does not contain the core export categories.
    #[error("This doesn't look like a valid export archive: {0}")]
    InvalidExport(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error(transparent)]
    External(#[from] anyhow::Error),
}

impl JobError {
    pub fn limit(limit: ResourceLimit, observed: u64, max: u64) -> Self {
        JobError::ResourceLimit {
            limit,
            observed,
            max,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }

    /// Short label recorded in the job payload for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "validation",
            JobError::ResourceLimit { .. } => "resource_limit",
            JobError::InvalidExport(_) => "invalid_export",
            JobError::Cancelled => "cancelled",
            JobError::External(_) => "external",
        }
    }

    /// Message safe to surface to the job owner.
    pub fn public_message(&self) -> String {
        match self {
            JobError::Validation(_) | JobError::ResourceLimit { .. } | JobError::InvalidExport(_) => {
                self.to_string()
            }
            JobError::Cancelled => CANCELLED_MESSAGE.to_string(),
            JobError::External(_) => GENERIC_FAILURE_MESSAGE.to_string(),
        }
    }
}

impl From<std::io::Error> for JobError {
    fn from(err: std::io::Error) -> Self {
        JobError::External(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceLimit {
    ArchiveEntries,
    MetadataFileSize,
    MediaFiles,
    MediaEntrySize,
    MediaTotalSize,
}

impl fmt::Display for ResourceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceLimit::ArchiveEntries => write!(f, "Archive entry count"),
            ResourceLimit::MetadataFileSize => write!(f, "Metadata file size"),
            ResourceLimit::MediaFiles => write!(f, "Media file count"),
            ResourceLimit::MediaEntrySize => write!(f, "Media file size"),
            ResourceLimit::MediaTotalSize => write!(f, "Total media size"),
        }
    }
}

/// Outcome of a single raw insert attempt against the external schema.
#[derive(Error, Debug)]
pub enum InsertError {
    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
