//! In-memory stores for tests and embedded use.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::{JobStore, MediaRecord, ProfileRef, SnapshotStore};
use crate::error::InsertError;
use crate::payload::deep_merge;
use crate::scrape::budget::Usd;
use crate::snapshot::Snapshot;
use crate::{Job, Status};

struct SpendEntry {
    owner_id: Uuid,
    cost: Usd,
    at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    spend: RwLock<Vec<SpendEntry>>,
    progress_log: RwLock<HashMap<Uuid, Vec<i16>>>,
    fail_status_writes: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job(&self, id: Uuid) -> Option<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Every progress value written for a job, in order.
    pub fn progress_history(&self, id: Uuid) -> Vec<i16> {
        self.progress_log
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes progress and payload writes fail, as a flaky database would.
    pub fn fail_status_writes(&self, fail: bool) {
        self.fail_status_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            bail!("status write rejected");
        }
        Ok(())
    }

    fn log_progress(&self, id: Uuid, progress: i16) {
        self.progress_log
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(id)
            .or_default()
            .push(progress);
    }

    fn with_job<T>(&self, id: Uuid, f: impl FnOnce(&mut Job) -> T) -> Result<T> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let job = jobs.get_mut(&id).ok_or_else(|| anyhow!("job {id} not found"))?;
        let out = f(job);
        job.updated_at = Utc::now();
        Ok(out)
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.job(id))
    }

    async fn queued_jobs(&self, limit: usize) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut queued: Vec<Job> = jobs
            .values()
            .filter(|j| j.status == Status::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|j| j.created_at);
        queued.truncate(limit);
        Ok(queued)
    }

    async fn reset_processing_jobs(&self) -> Result<u64> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let mut reset = 0;
        for job in jobs.values_mut().filter(|j| j.status == Status::Processing) {
            job.status = Status::Queued;
            reset += 1;
        }
        Ok(reset)
    }

    async fn begin_job(&self, id: Uuid, progress: i16, message: &str) -> Result<bool> {
        let began = self.with_job(id, |job| {
            if job.status != Status::Queued {
                return false;
            }
            job.status = Status::Processing;
            job.progress = progress;
            job.message = message.to_string();
            true
        })?;
        if began {
            self.log_progress(id, progress);
        }
        Ok(began)
    }

    async fn update_progress(&self, id: Uuid, progress: i16, message: &str) -> Result<()> {
        self.check_writable()?;
        self.with_job(id, |job| {
            job.progress = progress;
            job.message = message.to_string();
        })?;
        self.log_progress(id, progress);
        Ok(())
    }

    async fn merge_payload(&self, id: Uuid, patch: Value) -> Result<()> {
        self.check_writable()?;
        self.with_job(id, |job| deep_merge(&mut job.payload, patch))
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool> {
        Ok(self.job(id).map(|j| j.cancel_requested).unwrap_or(false))
    }

    async fn request_cancel(&self, id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&id) {
            Some(job) if !job.is_terminal() => {
                job.cancel_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_job(&self, id: Uuid, result_ref: Uuid, message: &str) -> Result<()> {
        self.with_job(id, |job| {
            job.status = Status::Completed;
            job.progress = 100;
            job.result_ref = Some(result_ref);
            job.message = message.to_string();
        })?;
        self.log_progress(id, 100);
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error_message: &str) -> Result<()> {
        self.with_job(id, |job| {
            job.status = Status::Failed;
            job.error_message = Some(error_message.to_string());
            job.message = error_message.to_string();
        })
    }

    async fn record_spend(&self, owner_id: Uuid, _job_id: Uuid, cost: Usd) -> Result<()> {
        self.spend
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(SpendEntry {
                owner_id,
                cost,
                at: Utc::now(),
            });
        Ok(())
    }

    async fn spent_since(&self, owner_id: Uuid, since: DateTime<Utc>) -> Result<Usd> {
        let spend = self.spend.read().unwrap_or_else(|e| e.into_inner());
        Ok(spend
            .iter()
            .filter(|s| s.owner_id == owner_id && s.at >= since)
            .fold(Usd::ZERO, |acc, s| acc.saturating_add(s.cost)))
    }
}

#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: RwLock<HashMap<Uuid, Snapshot>>,
    media: RwLock<Vec<Map<String, Value>>>,
    profiles: RwLock<HashMap<Uuid, ProfileRef>>,
    missing_columns: HashSet<String>,
    insert_attempts: AtomicUsize,
    fail_updates: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose media table lacks the given columns.
    pub fn with_missing_columns(columns: &[&str]) -> Self {
        MemorySnapshotStore {
            missing_columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Makes snapshot updates fail, as a database dropping out mid-finalize
    /// would.
    pub fn fail_snapshot_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    pub fn insert_attempts(&self) -> usize {
        self.insert_attempts.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, id: Uuid) -> Option<Snapshot> {
        self.snapshots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn media_rows(&self) -> Vec<Map<String, Value>> {
        self.media.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn profile(&self, owner_id: Uuid) -> Option<ProfileRef> {
        self.profiles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&owner_id)
            .cloned()
    }
}

fn row_matches(row: &Map<String, Value>, snapshot_id: Uuid) -> bool {
    row.get("snapshot_id").and_then(Value::as_str) == Some(snapshot_id.to_string().as_str())
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        if snapshots.contains_key(&snapshot.id) {
            bail!("snapshot {} already exists", snapshot.id);
        }
        snapshots.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            bail!("snapshot update rejected");
        }
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        match snapshots.get_mut(&snapshot.id) {
            Some(stored) => {
                *stored = snapshot.clone();
                Ok(())
            }
            None => bail!("snapshot {} not found", snapshot.id),
        }
    }

    async fn get_snapshot(&self, id: Uuid) -> Result<Option<Snapshot>> {
        Ok(self.snapshot(id))
    }

    async fn delete_snapshot(&self, id: Uuid) -> Result<bool> {
        Ok(self
            .snapshots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some())
    }

    async fn set_storage_bytes(&self, id: Uuid, bytes: u64) -> Result<()> {
        let mut snapshots = self.snapshots.write().unwrap_or_else(|e| e.into_inner());
        let snapshot = snapshots
            .get_mut(&id)
            .ok_or_else(|| anyhow!("snapshot {id} not found"))?;
        snapshot.storage_bytes = bytes;
        Ok(())
    }

    async fn media_exists(&self, snapshot_id: Uuid, path: &str) -> Result<bool> {
        let media = self.media.read().unwrap_or_else(|e| e.into_inner());
        Ok(media.iter().any(|row| {
            row_matches(row, snapshot_id) && row.get("path").and_then(Value::as_str) == Some(path)
        }))
    }

    async fn insert_media_row(&self, row: &Map<String, Value>) -> Result<(), InsertError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(column) = row.keys().find(|k| self.missing_columns.contains(*k)) {
            return Err(InsertError::UnknownColumn(column.clone()));
        }
        let mut media = self.media.write().unwrap_or_else(|e| e.into_inner());
        let duplicate = media
            .iter()
            .any(|r| r.get("snapshot_id") == row.get("snapshot_id") && r.get("path") == row.get("path"));
        if duplicate {
            return Err(InsertError::Other(anyhow!(
                "duplicate media row for path {:?}",
                row.get("path")
            )));
        }
        media.push(row.clone());
        Ok(())
    }

    async fn list_media(&self, snapshot_id: Uuid) -> Result<Vec<MediaRecord>> {
        let media = self.media.read().unwrap_or_else(|e| e.into_inner());
        media
            .iter()
            .filter(|row| row_matches(row, snapshot_id))
            .map(MediaRecord::from_row)
            .collect()
    }

    async fn delete_media(&self, snapshot_id: Uuid) -> Result<Vec<MediaRecord>> {
        let mut media = self.media.write().unwrap_or_else(|e| e.into_inner());
        let (removed, kept): (Vec<_>, Vec<_>) =
            media.drain(..).partition(|row| row_matches(row, snapshot_id));
        *media = kept;
        removed.iter().map(MediaRecord::from_row).collect()
    }

    async fn upsert_profile(&self, profile: &ProfileRef) -> Result<()> {
        self.profiles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(profile.owner_id, profile.clone());
        Ok(())
    }
}
