//! Teardown of an artifact that must not outlive its job.

use anyhow::Result;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use crate::blob::BlobStorage;
use crate::controller::JobContext;
use crate::error::JobError;
use crate::payload::JobPayload;
use crate::store::SnapshotStore;
use crate::worker::Services;

/// Deletes an artifact, its media rows and their objects.
///
/// Objects go first: if deleting them fails, the rows still point at them
/// and a later attempt can finish the job.
pub async fn discard_snapshot(
    snapshots: &dyn SnapshotStore,
    blobs: &dyn BlobStorage,
    snapshot_id: Uuid,
) -> Result<usize> {
    let media = snapshots.list_media(snapshot_id).await?;
    let paths: Vec<String> = media.iter().map(|m| m.path.clone()).collect();
    blobs.delete(&paths).await?;
    let removed = snapshots.delete_media(snapshot_id).await?;
    snapshots.delete_snapshot(snapshot_id).await?;
    info!(snapshot_id = %snapshot_id, objects = paths.len(), "Discarded partial snapshot");
    Ok(removed.len())
}

/// Runs the teardown of a run that ended in `err` and hands the error back.
///
/// A cancelled run reports the cleanup phase and ends with `cancelled` in
/// its payload; any other failure leaves its error kind there. In both cases
/// the artifact created so far, if any, is discarded.
pub async fn abandon(
    services: &Services,
    ctx: &JobContext,
    artifact: Option<Uuid>,
    err: JobError,
) -> JobError {
    if err.is_cancelled() {
        ctx.enter_cleanup("Cancelling and removing the partial backup");
    } else {
        ctx.merge_payload(&JobPayload {
            error_kind: Some(err.kind().to_string()),
            ..Default::default()
        });
    }

    if let Some(snapshot_id) = artifact {
        match discard_snapshot(&*services.snapshots, &*services.blobs, snapshot_id).await {
            Ok(_) => ctx.merge_payload_value(json!({ "artifact_id": null })),
            Err(cleanup_err) => {
                error!(snapshot_id = %snapshot_id, error = ?cleanup_err, "Could not discard partial snapshot")
            }
        }
    }

    if err.is_cancelled() {
        ctx.merge_payload(&JobPayload {
            cancelled: Some(true),
            ..Default::default()
        });
    }
    err
}
