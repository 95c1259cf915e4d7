use std::sync::Arc;

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::postgres::{PgPool, PgPoolOptions, Postgres};
use sqlx::{Executor, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use crate::error::InsertError;
use crate::payload::deep_merge;
use crate::scrape::budget::Usd;
use crate::snapshot::Snapshot;
use crate::store::{JobStore, MediaRecord, ProfileRef, SnapshotStore};
use crate::Job;

const JOB_COLUMNS: &str = "id, owner_id, kind, status, progress, message, params, payload, \
    result_ref, error_message, cancel_requested, created_at, updated_at";

/// SQLSTATE for a reference to a column that does not exist.
const UNDEFINED_COLUMN: &str = "42703";

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobStore for DbHandle {
    async fn create_job(&self, job: &Job) -> Result<(), Error> {
        debug!("Submitting job {}", job.id);
        sqlx::query(
            "INSERT INTO backup_jobs \
            (id, owner_id, kind, status, progress, message, params, payload, created_at, updated_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(job.id)
        .bind(job.owner_id)
        .bind(job.kind)
        .bind(job.status)
        .bind(job.progress)
        .bind(&job.message)
        .bind(&job.params)
        .bind(&job.payload)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, Error> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM backup_jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?)
    }

    async fn queued_jobs(&self, limit: usize) -> Result<Vec<Job>, Error> {
        debug!("Getting {} queued jobs", limit);
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM backup_jobs \
            WHERE status = 'queued' \
            ORDER BY created_at ASC \
            LIMIT $1"
        );
        Ok(sqlx::query_as::<_, Job>(&sql)
            .bind(to_i64(limit as u64))
            .fetch_all(&*self.pool)
            .await?)
    }

    async fn reset_processing_jobs(&self) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE backup_jobs \
                SET status = 'queued', updated_at = now() \
            WHERE status = 'processing'",
        )
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn begin_job(&self, id: Uuid, progress: i16, message: &str) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE backup_jobs \
                SET status = 'processing', progress = $2, message = $3, updated_at = now() \
            WHERE id = $1 AND status = 'queued'",
        )
        .bind(id)
        .bind(progress)
        .bind(message)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_progress(&self, id: Uuid, progress: i16, message: &str) -> Result<(), Error> {
        sqlx::query(
            "UPDATE backup_jobs \
                SET progress = $2, message = $3, updated_at = now() \
            WHERE id = $1 AND status = 'processing'",
        )
        .bind(id)
        .bind(progress)
        .bind(message)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn merge_payload(&self, id: Uuid, patch: Value) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;
        let stored: Option<Value> =
            sqlx::query_scalar("SELECT payload FROM backup_jobs WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        let mut payload = stored.ok_or_else(|| anyhow!("Job {id} not found"))?;
        deep_merge(&mut payload, patch);
        sqlx::query("UPDATE backup_jobs SET payload = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(&payload)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, Error> {
        let requested: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM backup_jobs WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;
        Ok(requested.unwrap_or(false))
    }

    async fn request_cancel(&self, id: Uuid) -> Result<bool, Error> {
        let result = sqlx::query(
            "UPDATE backup_jobs \
                SET cancel_requested = true, updated_at = now() \
            WHERE id = $1 AND status IN ('queued', 'processing')",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn complete_job(&self, id: Uuid, result_ref: Uuid, message: &str) -> Result<(), Error> {
        sqlx::query(
            "UPDATE backup_jobs \
                SET status = 'completed', progress = 100, result_ref = $2, message = $3, \
                error_message = NULL, updated_at = now() \
            WHERE id = $1",
        )
        .bind(id)
        .bind(result_ref)
        .bind(message)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn fail_job(&self, id: Uuid, error_message: &str) -> Result<(), Error> {
        sqlx::query(
            "UPDATE backup_jobs \
                SET status = 'failed', error_message = $2, message = $2, updated_at = now() \
            WHERE id = $1",
        )
        .bind(id)
        .bind(error_message)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn record_spend(&self, owner_id: Uuid, job_id: Uuid, cost: Usd) -> Result<(), Error> {
        sqlx::query("INSERT INTO scrape_spend (owner_id, job_id, cost_micros) VALUES ($1, $2, $3)")
            .bind(owner_id)
            .bind(job_id)
            .bind(to_i64(cost.micros()))
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn spent_since(&self, owner_id: Uuid, since: DateTime<Utc>) -> Result<Usd, Error> {
        let micros: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(cost_micros), 0)::bigint FROM scrape_spend \
            WHERE owner_id = $1 AND created_at >= $2",
        )
        .bind(owner_id)
        .bind(since)
        .fetch_one(&*self.pool)
        .await?;
        Ok(Usd::from_micros(micros.max(0) as u64))
    }
}

#[async_trait]
impl SnapshotStore for DbHandle {
    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO snapshots \
            (id, owner_id, job_id, source, document, storage_bytes, created_at) \
            VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(snapshot.id)
        .bind(snapshot.owner_id)
        .bind(snapshot.job_id)
        .bind(snapshot.source.as_str())
        .bind(serde_json::to_value(snapshot)?)
        .bind(to_i64(snapshot.storage_bytes))
        .bind(snapshot.created_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn update_snapshot(&self, snapshot: &Snapshot) -> Result<(), Error> {
        sqlx::query(
            "UPDATE snapshots \
                SET document = $2, storage_bytes = $3, updated_at = now() \
            WHERE id = $1",
        )
        .bind(snapshot.id)
        .bind(serde_json::to_value(snapshot)?)
        .bind(to_i64(snapshot.storage_bytes))
        .execute(&*self.pool)
        .await?;
        Ok(())
    }

    async fn get_snapshot(&self, id: Uuid) -> Result<Option<Snapshot>, Error> {
        let row: Option<(Value, i64)> =
            sqlx::query_as("SELECT document, storage_bytes FROM snapshots WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;
        let Some((document, storage_bytes)) = row else {
            return Ok(None);
        };
        let mut snapshot: Snapshot = serde_json::from_value(document)?;
        snapshot.storage_bytes = storage_bytes.max(0) as u64;
        Ok(Some(snapshot))
    }

    async fn delete_snapshot(&self, id: Uuid) -> Result<bool, Error> {
        let result = sqlx::query("DELETE FROM snapshots WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_storage_bytes(&self, id: Uuid, bytes: u64) -> Result<(), Error> {
        sqlx::query("UPDATE snapshots SET storage_bytes = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(to_i64(bytes))
            .execute(&*self.pool)
            .await?;
        Ok(())
    }

    async fn media_exists(&self, snapshot_id: Uuid, path: &str) -> Result<bool, Error> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM media_files WHERE snapshot_id = $1 AND path = $2)",
        )
        .bind(snapshot_id)
        .bind(path)
        .fetch_one(&*self.pool)
        .await?)
    }

    async fn insert_media_row(&self, row: &Map<String, Value>) -> Result<(), InsertError> {
        if let Some(bad) = row.keys().find(|column| !is_identifier(column)) {
            return Err(InsertError::Other(anyhow!("invalid column name {bad:?}")));
        }
        let columns = row.keys().map(String::as_str).collect::<Vec<_>>().join(", ");

        // Postgres does the type conversion from the JSON row.
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new("INSERT INTO media_files (");
        query.push(&columns);
        query.push(") SELECT ");
        query.push(&columns);
        query.push(" FROM jsonb_populate_record(NULL::media_files, ");
        query.push_bind(Value::Object(row.clone()));
        query.push(")");

        match query.build().execute(&*self.pool).await {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(err)) if err.code().as_deref() == Some(UNDEFINED_COLUMN) => {
                match quoted_name(err.message()) {
                    Some(column) => Err(InsertError::UnknownColumn(column)),
                    None => Err(InsertError::Other(anyhow!("{}", err.message()))),
                }
            }
            Err(err) => Err(InsertError::Other(err.into())),
        }
    }

    async fn list_media(&self, snapshot_id: Uuid) -> Result<Vec<MediaRecord>, Error> {
        let rows: Vec<Value> = sqlx::query_scalar(
            "SELECT to_jsonb(m) FROM media_files m \
            WHERE m.snapshot_id = $1 \
            ORDER BY m.created_at ASC",
        )
        .bind(snapshot_id)
        .fetch_all(&*self.pool)
        .await?;
        rows.into_iter().map(record_of).collect()
    }

    async fn delete_media(&self, snapshot_id: Uuid) -> Result<Vec<MediaRecord>, Error> {
        let rows: Vec<Value> = sqlx::query_scalar(
            "DELETE FROM media_files m WHERE m.snapshot_id = $1 RETURNING to_jsonb(m)",
        )
        .bind(snapshot_id)
        .fetch_all(&*self.pool)
        .await?;
        rows.into_iter().map(record_of).collect()
    }

    async fn upsert_profile(&self, profile: &ProfileRef) -> Result<(), Error> {
        sqlx::query(
            "INSERT INTO profiles (owner_id, username, display_name, latest_snapshot_id, updated_at) \
            VALUES ($1, $2, $3, $4, $5) \
            ON CONFLICT (owner_id) DO UPDATE SET \
                username = EXCLUDED.username, \
                display_name = EXCLUDED.display_name, \
                latest_snapshot_id = EXCLUDED.latest_snapshot_id, \
                updated_at = EXCLUDED.updated_at",
        )
        .bind(profile.owner_id)
        .bind(&profile.username)
        .bind(&profile.display_name)
        .bind(profile.latest_snapshot_id)
        .bind(profile.updated_at)
        .execute(&*self.pool)
        .await?;
        Ok(())
    }
}

fn record_of(row: Value) -> Result<MediaRecord, Error> {
    match row {
        Value::Object(row) => MediaRecord::from_row(&row),
        other => Err(anyhow!("unexpected media row {other}")),
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
        && !name.as_bytes()[0].is_ascii_digit()
}

/// First double-quoted name in a server message, e.g. `column "x" of
/// relation "y" does not exist`.
fn quoted_name(message: &str) -> Option<String> {
    let (_, rest) = message.split_once('"')?;
    let (name, _) = rest.split_once('"')?;
    Some(name.to_string())
}
