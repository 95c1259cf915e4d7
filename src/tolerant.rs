//! Inserts that survive a schema lagging behind the code.

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::InsertError;
use crate::store::SnapshotStore;

/// Inserts `row`, dropping one optional column per rejected attempt.
///
/// Only columns listed in `optional` and present in the row are ever
/// dropped, so the number of retries is bounded by `optional.len()`. Any
/// other error is returned as is.
pub async fn insert_media_row(
    store: &dyn SnapshotStore,
    mut row: Map<String, Value>,
    optional: &[&str],
) -> Result<(), InsertError> {
    loop {
        match store.insert_media_row(&row).await {
            Ok(()) => return Ok(()),
            Err(InsertError::UnknownColumn(column))
                if optional.contains(&column.as_str()) && row.contains_key(&column) =>
            {
                warn!(column = %column, "Media table lacks optional column, retrying without it");
                row.remove(&column);
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemorySnapshotStore, OPTIONAL_MEDIA_COLUMNS};
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn unknown_optional_column_is_dropped_and_retried() {
        let store = MemorySnapshotStore::with_missing_columns(&["tweet_id"]);
        let record = row(json!({"snapshot_id": "s", "path": "p/1.jpg", "tweet_id": "99"}));

        insert_media_row(&store, record, OPTIONAL_MEDIA_COLUMNS).await.unwrap();

        assert_eq!(store.insert_attempts(), 2);
        let stored = store.media_rows();
        assert_eq!(stored.len(), 1);
        assert!(!stored[0].contains_key("tweet_id"));
    }

    #[tokio::test]
    async fn row_without_optional_fields_is_inserted_once() {
        let store = MemorySnapshotStore::with_missing_columns(&["tweet_id"]);
        let record = row(json!({"snapshot_id": "s", "path": "p/1.jpg"}));

        insert_media_row(&store, record, OPTIONAL_MEDIA_COLUMNS).await.unwrap();

        assert_eq!(store.insert_attempts(), 1);
    }

    #[tokio::test]
    async fn every_optional_column_can_be_dropped() {
        let store = MemorySnapshotStore::with_missing_columns(OPTIONAL_MEDIA_COLUMNS);
        let record = row(json!({
            "snapshot_id": "s",
            "path": "p/1.jpg",
            "tweet_id": "1",
            "original_filename": "1.jpg",
            "conversation_id": "c",
        }));

        insert_media_row(&store, record, OPTIONAL_MEDIA_COLUMNS).await.unwrap();

        assert_eq!(store.insert_attempts(), 4);
    }

    #[tokio::test]
    async fn unknown_required_column_is_surfaced() {
        let store = MemorySnapshotStore::with_missing_columns(&["mime_type"]);
        let record = row(json!({"snapshot_id": "s", "path": "p", "mime_type": "image/png"}));

        let err = insert_media_row(&store, record, OPTIONAL_MEDIA_COLUMNS)
            .await
            .unwrap_err();

        assert!(matches!(err, InsertError::UnknownColumn(c) if c == "mime_type"));
        assert_eq!(store.insert_attempts(), 1);
    }
}
