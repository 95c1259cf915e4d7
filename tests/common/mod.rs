#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zip::write::SimpleFileOptions;

use backupq::blob::{BlobStorage, MemoryBlobStorage};
use backupq::scrape::budget::Usd;
use backupq::scrape::fetch::{Fetched, MediaFetcher};
use backupq::scrape::provider::{ProviderUpdate, RunOutcome, ScrapeOutput, ScrapeParams, ScrapeProvider};
use backupq::snapshot::{Follow, MediaRef, Post, Profile};
use backupq::store::{JobStore, MemoryJobStore, MemorySnapshotStore};
use backupq::worker::Services;
use backupq::{EngineConfig, Job, JobParams, JobRequest};

pub const ARCHIVE_PATH: &str = "uploads/export.zip";

/// Builds a zip in memory.
pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, bytes) in files {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

pub fn js_file(variable: &str, records: Value) -> Vec<u8> {
    format!("window.YTD.{variable}.part0 = {records}").into_bytes()
}

/// A small but complete export: one account, two posts (one with a photo),
/// one follower and one photo in the media folder.
pub fn sample_export() -> Vec<u8> {
    let account = js_file(
        "account",
        json!([{"account": {"accountId": "1", "username": "alice", "accountDisplayName": "Alice"}}]),
    );
    let tweets = js_file(
        "tweets",
        json!([
            {"tweet": {
                "id_str": "10",
                "full_text": "sunset",
                "entities": {"media": [{"media_url_https": "https://pbs.twimg.com/media/abc.jpg", "type": "photo"}]}
            }},
            {"tweet": {"id_str": "11", "full_text": "@bob yes", "in_reply_to_status_id_str": "9", "in_reply_to_screen_name": "bob"}}
        ]),
    );
    let followers = js_file("follower", json!([{"follower": {"accountId": "2", "userLink": "https://x.com/intent/user?user_id=2"}}]));
    zip_bytes(&[
        ("data/account.js", &account),
        ("data/tweets.js", &tweets),
        ("data/follower.js", &followers),
        ("data/tweets_media/10-abc.jpg", b"jpeg bytes"),
        ("data/tweets_media/.DS_Store", b"junk"),
    ])
}

/// Blob storage that asks for the job to be cancelled once it has stored
/// `after` objects.
pub struct CancelAfterPuts {
    pub inner: Arc<MemoryBlobStorage>,
    pub jobs: Arc<MemoryJobStore>,
    pub job_id: Uuid,
    pub after: usize,
    pub puts: AtomicUsize,
}

#[async_trait]
impl BlobStorage for CancelAfterPuts {
    async fn put(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.inner.put(path, bytes, content_type).await?;
        if self.puts.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.jobs.request_cancel(self.job_id).await?;
        }
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(path).await
    }

    async fn delete(&self, paths: &[String]) -> Result<()> {
        self.inner.delete(paths).await
    }
}

/// How the fake provider behaves once called.
#[derive(Clone)]
pub enum Script {
    /// Sends the updates and returns the output.
    Finish(Vec<ProviderUpdate>, ScrapeOutput),
    /// Sends the updates, then waits for the cancellation token and returns
    /// the output marked as aborted.
    UntilCancelled(Vec<ProviderUpdate>, ScrapeOutput),
    /// Sends the updates, then fails.
    FailAfter(Vec<ProviderUpdate>, String),
    Error(String),
}

pub struct FakeProvider {
    script: Script,
    pub calls: AtomicUsize,
    pub params: Mutex<Option<ScrapeParams>>,
}

impl FakeProvider {
    pub fn new(script: Script) -> Self {
        FakeProvider {
            script,
            calls: AtomicUsize::new(0),
            params: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScrapeProvider for FakeProvider {
    async fn run_scrape(
        &self,
        params: &ScrapeParams,
        updates: UnboundedSender<ProviderUpdate>,
        cancel: CancellationToken,
    ) -> Result<ScrapeOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.params.lock().unwrap() = Some(params.clone());
        match &self.script {
            Script::Finish(sent, output) => {
                for update in sent {
                    let _ = updates.send(update.clone());
                }
                Ok(output.clone())
            }
            Script::UntilCancelled(sent, output) => {
                for update in sent {
                    let _ = updates.send(update.clone());
                }
                tokio::time::timeout(Duration::from_secs(10), cancel.cancelled())
                    .await
                    .map_err(|_| anyhow!("never cancelled"))?;
                Ok(ScrapeOutput {
                    outcome: RunOutcome::Aborted,
                    ..output.clone()
                })
            }
            Script::FailAfter(sent, message) => {
                for update in sent {
                    let _ = updates.send(update.clone());
                }
                Err(anyhow!("{message}"))
            }
            Script::Error(message) => Err(anyhow!("{message}")),
        }
    }
}

/// Serves fixed bodies by URL; anything else is a fetch error.
#[derive(Default)]
pub struct FakeFetcher {
    pub bodies: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl MediaFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Fetched> {
        match self.bodies.get(url) {
            Some(body) if body.len() as u64 > max_bytes => Ok(Fetched::TooLarge {
                observed: body.len() as u64,
            }),
            Some(body) => Ok(Fetched::Bytes(body.clone())),
            None => Err(anyhow!("404 for {url}")),
        }
    }
}

/// Fetcher that asks for the job to be cancelled on every fetch, then serves
/// from `inner`.
pub struct CancelOnFetch {
    pub inner: FakeFetcher,
    pub jobs: Arc<MemoryJobStore>,
    pub job_id: Uuid,
}

#[async_trait]
impl MediaFetcher for CancelOnFetch {
    async fn fetch(&self, url: &str, max_bytes: u64) -> Result<Fetched> {
        self.jobs.request_cancel(self.job_id).await?;
        self.inner.fetch(url, max_bytes).await
    }
}

pub fn post(id: &str, media: &[&str]) -> Post {
    Post {
        id: id.into(),
        text: format!("post {id}"),
        media: media
            .iter()
            .map(|url| MediaRef {
                url: url.to_string(),
                kind: Some("photo".into()),
            })
            .collect(),
        ..Default::default()
    }
}

pub fn scrape_output(posts: Vec<Post>, followers: usize, cost: Usd, outcome: RunOutcome) -> ScrapeOutput {
    ScrapeOutput {
        profile: Some(Profile {
            username: "alice".into(),
            ..Default::default()
        }),
        posts,
        followers: (0..followers)
            .map(|i| Follow {
                account_id: format!("f{i}"),
                ..Default::default()
            })
            .collect(),
        run_ids: [("timeline".to_string(), "run-1".to_string())].into(),
        cost,
        outcome,
        ..ScrapeOutput::empty(RunOutcome::Succeeded)
    }
}

pub struct Harness {
    pub jobs: Arc<MemoryJobStore>,
    pub snapshots: Arc<MemorySnapshotStore>,
    pub blobs: Arc<MemoryBlobStorage>,
    pub provider: Arc<FakeProvider>,
    pub services: Services,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(
            Script::Error("provider not scripted".into()),
            FakeFetcher::default(),
            EngineConfig::default(),
        )
    }

    pub fn with(script: Script, fetcher: FakeFetcher, mut config: EngineConfig) -> Self {
        config.cancel_poll_interval = Duration::from_millis(10);
        config.poll_interval = Duration::from_millis(10);
        let jobs = Arc::new(MemoryJobStore::new());
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let blobs = Arc::new(MemoryBlobStorage::new());
        let provider = Arc::new(FakeProvider::new(script));
        let services = Services {
            jobs: jobs.clone(),
            snapshots: snapshots.clone(),
            blobs: blobs.clone(),
            provider: provider.clone(),
            fetcher: Arc::new(fetcher),
            config: Arc::new(config),
        };
        Harness {
            jobs,
            snapshots,
            blobs,
            provider,
            services,
        }
    }

    pub async fn submit(&self, owner_id: Uuid, params: JobParams) -> Job {
        let job = Job::queued(&JobRequest { owner_id, params }).unwrap();
        self.jobs.create_job(&job).await.unwrap();
        job
    }

    pub fn job(&self, id: Uuid) -> Job {
        self.jobs.job(id).unwrap()
    }
}
