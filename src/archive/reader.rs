//! Bounded access to a ZIP export on local disk.
//!
//! Only the central directory is read up front. Entry contents are
//! decompressed one at a time on request, on the blocking pool, and never
//! beyond the caller's byte ceiling.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tracing::debug;
use zip::ZipArchive;

use crate::error::{JobError, ResourceLimit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub index: usize,
    pub name: String,
    /// Uncompressed size as declared by the archive.
    pub size: u64,
    pub is_dir: bool,
}

impl EntryInfo {
    pub fn file_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    /// Directory part of the entry name, if any.
    pub fn folder(&self) -> Option<&str> {
        self.name.rsplit_once('/').map(|(folder, _)| folder).filter(|f| !f.is_empty())
    }
}

#[derive(Clone)]
pub struct ArchiveReader {
    zip: Arc<Mutex<ZipArchive<File>>>,
    entries: Arc<Vec<EntryInfo>>,
}

impl ArchiveReader {
    /// Opens the archive and lists its entries, refusing archives with more
    /// than `max_entries` entries before looking at any of them.
    pub async fn open(path: PathBuf, max_entries: usize) -> Result<Self, JobError> {
        tokio::task::spawn_blocking(move || {
            let file = File::open(&path)?;
            let mut zip = ZipArchive::new(file).map_err(|err| {
                JobError::InvalidExport(format!("the upload is not a readable ZIP file ({err})"))
            })?;
            if zip.len() > max_entries {
                return Err(JobError::limit(
                    ResourceLimit::ArchiveEntries,
                    zip.len() as u64,
                    max_entries as u64,
                ));
            }
            let mut entries = Vec::with_capacity(zip.len());
            for index in 0..zip.len() {
                let entry = zip.by_index_raw(index).map_err(|err| {
                    JobError::InvalidExport(format!("entry {index} is unreadable ({err})"))
                })?;
                entries.push(EntryInfo {
                    index,
                    name: entry.name().to_string(),
                    size: entry.size(),
                    is_dir: entry.is_dir(),
                });
            }
            debug!(entries = entries.len(), "Opened archive");
            Ok(ArchiveReader {
                zip: Arc::new(Mutex::new(zip)),
                entries: Arc::new(entries),
            })
        })
        .await
        .map_err(|err| JobError::External(err.into()))?
    }

    pub fn entries(&self) -> &[EntryInfo] {
        &self.entries
    }

    /// Decompresses one entry, stopping as soon as more than `max_bytes`
    /// come out regardless of the declared size.
    pub async fn read_limited(
        &self,
        entry: &EntryInfo,
        max_bytes: u64,
        limit: ResourceLimit,
    ) -> Result<Vec<u8>, JobError> {
        if entry.size > max_bytes {
            return Err(JobError::limit(limit, entry.size, max_bytes));
        }
        let zip = self.zip.clone();
        let index = entry.index;
        tokio::task::spawn_blocking(move || {
            let mut zip = zip
                .lock()
                .map_err(|_| JobError::External(anyhow!("archive reader lock poisoned")))?;
            let file = zip
                .by_index(index)
                .map_err(|err| JobError::External(anyhow!("opening entry {index}: {err}")))?;
            let mut bytes = Vec::new();
            file.take(max_bytes.saturating_add(1)).read_to_end(&mut bytes)?;
            if bytes.len() as u64 > max_bytes {
                return Err(JobError::limit(limit, bytes.len() as u64, max_bytes));
            }
            Ok(bytes)
        })
        .await
        .map_err(|err| JobError::External(err.into()))?
    }

    pub async fn read_to_string(
        &self,
        entry: &EntryInfo,
        max_bytes: u64,
    ) -> Result<String, JobError> {
        let bytes = self
            .read_limited(entry, max_bytes, ResourceLimit::MetadataFileSize)
            .await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
