mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use backupq::blob::BlobStorage;
use backupq::server::{self, ClientRequest, WorkResponseMessage};
use backupq::store::{JobStore, MemorySnapshotStore};
use backupq::worker;
use backupq::{
    ArchiveParams, EngineConfig, JobController, JobError, JobParams, JobRequest, Status, CANCELLED_MESSAGE,
};

use common::*;

fn archive_params() -> JobParams {
    JobParams::ArchiveUpload(ArchiveParams {
        blob_path: ARCHIVE_PATH.into(),
        file_name: Some("twitter-export.zip".into()),
    })
}

async fn upload(harness: &Harness, bytes: Vec<u8>) -> u64 {
    let len = bytes.len() as u64;
    harness
        .blobs
        .put(ARCHIVE_PATH, bytes, "application/zip")
        .await
        .unwrap();
    len
}

async fn run_to_end(harness: &Harness, job_id: Uuid) -> Result<worker::JobOutput, JobError> {
    let job = harness.job(job_id);
    let outcome = worker::process(&harness.services, &job).await;
    server::settle(&JobController::new(harness.services.jobs.clone()), job_id, &outcome)
        .await
        .unwrap();
    outcome
}

fn assert_monotonic(history: &[i16]) {
    assert!(
        history.windows(2).all(|w| w[0] <= w[1]),
        "progress went backwards: {history:?}"
    );
}

#[tokio::test]
async fn export_becomes_snapshot_with_rehosted_media() {
    let harness = Harness::new();
    let archive_size = upload(&harness, sample_export()).await;
    let owner = Uuid::new_v4();
    let job = harness.submit(owner, archive_params()).await;

    let output = run_to_end(&harness, job.id).await.unwrap();

    let stored = harness.job(job.id);
    assert_eq!(stored.status, Status::Completed);
    assert_eq!(stored.progress, 100);
    assert_eq!(stored.result_ref, Some(output.result_ref));
    assert_eq!(stored.payload["phase"], "completed");
    assert_eq!(stored.payload["media_total"], 1);
    assert_eq!(stored.payload["media_processed"], 1);
    assert_eq!(stored.payload["counts"]["posts"], 1);
    assert_eq!(stored.payload["counts"]["replies"], 1);

    let snapshot = harness.snapshots.snapshot(output.result_ref).unwrap();
    assert_eq!(snapshot.profile.as_ref().unwrap().username, "alice");
    assert_eq!(snapshot.posts.len(), 1);
    assert_eq!(snapshot.replies.len(), 1);
    assert_eq!(snapshot.followers.len(), 1);

    let photo_path = format!("{owner}/post/{}/data_tweets_media/10-abc.jpg", snapshot.id);
    assert!(harness.blobs.contains(&photo_path));
    assert_eq!(harness.blobs.content_type(&photo_path).as_deref(), Some("image/jpeg"));
    assert_eq!(snapshot.posts[0].media[0].url, format!("/media/{photo_path}"));

    let rows = harness.snapshots.media_rows();
    assert_eq!(rows.len(), 2);
    let archive_copy = format!("{owner}/archive/{}/twitter-export.zip", snapshot.id);
    assert!(rows.iter().any(|r| r["category"] == "archive" && r["path"] == archive_copy.as_str()));
    assert!(harness.blobs.contains(&archive_copy));
    assert!(harness.blobs.contains(ARCHIVE_PATH));
    let photo = rows.iter().find(|r| r["path"] == photo_path.as_str()).unwrap();
    assert_eq!(photo["tweet_id"], "10");
    assert!(snapshot.archive_media_id.is_some());

    assert_eq!(snapshot.storage_bytes, archive_size + b"jpeg bytes".len() as u64);
    assert_eq!(snapshot.stats.media_files, 2);

    let profile = harness.snapshots.profile(owner).unwrap();
    assert_eq!(profile.latest_snapshot_id, snapshot.id);

    assert_monotonic(&harness.jobs.progress_history(job.id));
}

#[tokio::test]
async fn redelivered_job_reuses_its_snapshot_and_media() {
    let harness = Harness::new();
    upload(&harness, sample_export()).await;
    let job = harness.submit(Uuid::new_v4(), archive_params()).await;

    let first = run_to_end(&harness, job.id).await.unwrap();
    let rows_after_first = harness.snapshots.media_rows().len();

    let again = worker::process(&harness.services, &harness.job(job.id)).await.unwrap();

    assert_eq!(again.result_ref, first.result_ref);
    assert_eq!(harness.snapshots.snapshot_count(), 1);
    assert_eq!(harness.snapshots.media_rows().len(), rows_after_first);
}

#[tokio::test]
async fn media_count_ceiling_fails_and_discards_the_snapshot() {
    let mut config = EngineConfig::default();
    config.limits.max_media_files = 1;
    let harness = Harness::with(Script::Error("unused".into()), FakeFetcher::default(), config);
    upload(&harness, sample_export()).await;
    let job = harness.submit(Uuid::new_v4(), archive_params()).await;

    let err = run_to_end(&harness, job.id).await.unwrap_err();

    assert!(matches!(err, JobError::ResourceLimit { .. }));
    let stored = harness.job(job.id);
    assert_eq!(stored.status, Status::Failed);
    assert_eq!(
        stored.error_message.as_deref(),
        Some("Media file count limit exceeded: 2 > 1")
    );
    assert_eq!(stored.payload["error_kind"], "resource_limit");
    assert!(stored.payload.get("artifact_id").is_none());
    assert_eq!(harness.snapshots.snapshot_count(), 0);
    assert!(harness.snapshots.media_rows().is_empty());
    assert_eq!(harness.blobs.paths(), vec![ARCHIVE_PATH.to_string()]);
}

#[tokio::test]
async fn cancellation_mid_upload_removes_everything_created() {
    let mut harness = Harness::new();
    let account = js_file("account", serde_json::json!([{"account": {"accountId": "1", "username": "alice"}}]));
    let tweets = js_file("tweets", serde_json::json!([{"tweet": {"id_str": "10", "full_text": "hi"}}]));
    upload(
        &harness,
        zip_bytes(&[
            ("data/account.js", &account),
            ("data/tweets.js", &tweets),
            ("data/tweets_media/10-a.jpg", b"one"),
            ("data/tweets_media/10-b.jpg", b"two"),
            ("data/tweets_media/10-c.jpg", b"three"),
        ]),
    )
    .await;
    let job = harness.submit(Uuid::new_v4(), archive_params()).await;
    harness.services.blobs = Arc::new(CancelAfterPuts {
        inner: harness.blobs.clone(),
        jobs: harness.jobs.clone(),
        job_id: job.id,
        after: 1,
        puts: AtomicUsize::new(0),
    });

    let err = run_to_end(&harness, job.id).await.unwrap_err();

    assert!(err.is_cancelled());
    let stored = harness.job(job.id);
    assert_eq!(stored.status, Status::Failed);
    assert_eq!(stored.error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(stored.payload["cancelled"], true);
    assert_eq!(stored.payload["phase"], "cleanup");
    assert!(stored.payload.get("artifact_id").is_none());
    assert_eq!(harness.snapshots.snapshot_count(), 0);
    assert!(harness.snapshots.media_rows().is_empty());
    assert_eq!(harness.blobs.paths(), vec![ARCHIVE_PATH.to_string()]);
    assert_monotonic(&harness.jobs.progress_history(job.id));
}

#[tokio::test]
async fn cancelled_before_start_never_creates_a_snapshot() {
    let harness = Harness::new();
    upload(&harness, sample_export()).await;
    let job = harness.submit(Uuid::new_v4(), archive_params()).await;
    assert!(harness.jobs.request_cancel(job.id).await.unwrap());

    let err = run_to_end(&harness, job.id).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(harness.job(job.id).error_message.as_deref(), Some(CANCELLED_MESSAGE));
    assert_eq!(harness.snapshots.snapshot_count(), 0);
}

#[tokio::test]
async fn export_without_account_is_rejected() {
    let harness = Harness::new();
    let tweets = js_file("tweets", serde_json::json!([]));
    upload(&harness, zip_bytes(&[("data/tweets.js", &tweets)])).await;
    let job = harness.submit(Uuid::new_v4(), archive_params()).await;

    let err = run_to_end(&harness, job.id).await.unwrap_err();

    assert!(matches!(err, JobError::InvalidExport(_)));
    let stored = harness.job(job.id);
    assert_eq!(stored.status, Status::Failed);
    assert!(stored
        .error_message
        .unwrap()
        .contains("no account information found"));
    assert_eq!(stored.payload["error_kind"], "invalid_export");
}

#[tokio::test]
async fn missing_upload_is_a_validation_error() {
    let harness = Harness::new();
    let job = harness.submit(Uuid::new_v4(), archive_params()).await;

    let err = run_to_end(&harness, job.id).await.unwrap_err();

    assert!(matches!(err, JobError::Validation(_)));
    assert_eq!(harness.job(job.id).status, Status::Failed);
}

#[tokio::test]
async fn older_media_table_without_optional_columns_still_ingests() {
    let mut harness = Harness::new();
    let snapshots = Arc::new(MemorySnapshotStore::with_missing_columns(&["tweet_id", "conversation_id"]));
    harness.services.snapshots = snapshots.clone();
    upload(&harness, sample_export()).await;
    let job = harness.submit(Uuid::new_v4(), archive_params()).await;

    run_to_end(&harness, job.id).await.unwrap();

    let rows = snapshots.media_rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| !r.contains_key("tweet_id")));
    assert!(rows.iter().all(|r| r.get("original_filename").is_some_and(Value::is_string)));
}

#[tokio::test]
async fn failure_while_finalizing_keeps_the_original_upload() {
    let harness = Harness::new();
    upload(&harness, sample_export()).await;
    let job = harness.submit(Uuid::new_v4(), archive_params()).await;
    harness.snapshots.fail_snapshot_updates(true);

    let err = run_to_end(&harness, job.id).await.unwrap_err();

    assert!(matches!(err, JobError::External(_)));
    assert_eq!(harness.job(job.id).status, Status::Failed);
    assert_eq!(harness.snapshots.snapshot_count(), 0);
    assert!(harness.snapshots.media_rows().is_empty());
    assert_eq!(harness.blobs.paths(), vec![ARCHIVE_PATH.to_string()]);
}

#[tokio::test]
async fn equal_names_in_different_media_folders_are_both_stored() {
    let harness = Harness::new();
    let account = js_file("account", serde_json::json!([{"account": {"accountId": "1", "username": "alice"}}]));
    let tweets = js_file("tweets", serde_json::json!([{"tweet": {"id_str": "10", "full_text": "hi"}}]));
    upload(
        &harness,
        zip_bytes(&[
            ("data/account.js", &account),
            ("data/tweets.js", &tweets),
            ("data/tweets_media/10-a.jpg", b"one"),
            ("data/community_tweet_media/10-a.jpg", b"other"),
        ]),
    )
    .await;
    let job = harness.submit(Uuid::new_v4(), archive_params()).await;

    let output = run_to_end(&harness, job.id).await.unwrap();

    let post_rows: Vec<_> = harness
        .snapshots
        .media_rows()
        .into_iter()
        .filter(|r| r["category"] == "post")
        .collect();
    assert_eq!(post_rows.len(), 2);
    assert_ne!(post_rows[0]["path"], post_rows[1]["path"]);
    let snapshot = harness.snapshots.snapshot(output.result_ref).unwrap();
    assert_eq!(snapshot.stats.media_files, 3);
    assert_eq!(harness.job(job.id).payload["media_processed"], 2);
}

#[tokio::test]
async fn export_without_username_completes_without_a_profile_link() {
    let harness = Harness::new();
    let profile = js_file(
        "profile",
        serde_json::json!([{"profile": {"description": {"bio": "hello"}}}]),
    );
    let tweets = js_file("tweets", serde_json::json!([{"tweet": {"id_str": "10", "full_text": "hi"}}]));
    upload(
        &harness,
        zip_bytes(&[("data/profile.js", &profile), ("data/tweets.js", &tweets)]),
    )
    .await;
    let owner = Uuid::new_v4();
    let job = harness.submit(owner, archive_params()).await;

    let output = run_to_end(&harness, job.id).await.unwrap();

    let snapshot = harness.snapshots.snapshot(output.result_ref).unwrap();
    assert_eq!(snapshot.profile.unwrap().bio.as_deref(), Some("hello"));
    assert!(harness.snapshots.profile(owner).is_none());
}

#[tokio::test]
async fn queue_with_more_jobs_than_workers_is_drained() {
    let harness = Harness::new();
    upload(&harness, sample_export()).await;
    let mut submitted = Vec::new();
    for _ in 0..3 {
        submitted.push(harness.submit(Uuid::new_v4(), archive_params()).await.id);
    }
    let cancel = CancellationToken::new();
    let (_send_to_server, recv_from_client) = mpsc::unbounded_channel();
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let server = tokio::spawn(server::serve(
        cancel.clone(),
        harness.services.clone(),
        1,
        recv_from_client,
        send_to_client,
    ));

    let mut completed = Vec::new();
    while completed.len() < submitted.len() {
        match timeout(Duration::from_secs(10), recv_from_server.recv()).await.unwrap() {
            Some(WorkResponseMessage::JobCompleted(id, _)) => completed.push(id),
            Some(WorkResponseMessage::JobFailed(_, message)) => panic!("job failed: {message}"),
            Some(_) => continue,
            None => panic!("server went away"),
        }
    }

    cancel.cancel();
    server.await.unwrap().unwrap();

    completed.sort();
    submitted.sort();
    assert_eq!(completed, submitted);
    for id in submitted {
        assert_eq!(harness.job(id).status, Status::Completed);
    }
}

#[tokio::test]
async fn served_job_is_picked_up_and_completed() {
    let harness = Harness::new();
    upload(&harness, sample_export()).await;
    let cancel = CancellationToken::new();
    let (send_to_server, recv_from_client) = mpsc::unbounded_channel();
    let (send_to_client, mut recv_from_server) = mpsc::unbounded_channel();

    let server = tokio::spawn(server::serve(
        cancel.clone(),
        harness.services.clone(),
        2,
        recv_from_client,
        send_to_client,
    ));

    send_to_server
        .send(ClientRequest::Submit(JobRequest {
            owner_id: Uuid::new_v4(),
            params: archive_params(),
        }))
        .unwrap();

    let submitted = match timeout(Duration::from_secs(5), recv_from_server.recv()).await.unwrap() {
        Some(WorkResponseMessage::JobSubmitted(id)) => id,
        other => panic!("unexpected response {other:?}"),
    };
    let result_ref = loop {
        match timeout(Duration::from_secs(5), recv_from_server.recv()).await.unwrap() {
            Some(WorkResponseMessage::JobCompleted(id, result_ref)) => {
                assert_eq!(id, submitted);
                break result_ref;
            }
            Some(WorkResponseMessage::JobFailed(_, message)) => panic!("job failed: {message}"),
            Some(_) => continue,
            None => panic!("server went away"),
        }
    };

    cancel.cancel();
    server.await.unwrap().unwrap();

    let stored = harness.job(submitted);
    assert_eq!(stored.status, Status::Completed);
    assert_eq!(stored.result_ref, Some(result_ref));
}
