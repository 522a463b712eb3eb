//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `Storage` | Job id collision |
//! | Database (check constraint violation) | `23514` | `InvalidRow` | Unknown status, negative try count |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |
//!
//! Row locks (`SELECT ... FOR UPDATE`) are held until the surrounding
//! transaction commits or rolls back.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use steward_core::{Job, JobId, JobStatus, ServiceStatus};

use super::store::{JobStore, ServiceStore, StoreError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id           uuid        PRIMARY KEY,
    type         text        NOT NULL,
    related_type text        NOT NULL,
    related_id   text        NOT NULL,
    status       text        NOT NULL
                 CHECK (status IN ('active', 'done', 'failed', 'canceled')),
    try_count    integer     NOT NULL DEFAULT 0 CHECK (try_count >= 0),
    not_before   timestamptz NOT NULL,
    created_at   timestamptz NOT NULL,
    created_by   text        NOT NULL,
    data         jsonb       NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS jobs_type_idx ON jobs (type);
CREATE INDEX IF NOT EXISTS jobs_related_id_idx ON jobs (related_id);
CREATE INDEX IF NOT EXISTS jobs_status_idx ON jobs (status);
CREATE INDEX IF NOT EXISTS jobs_not_before_idx ON jobs (not_before);

CREATE TABLE IF NOT EXISTS channels (
    id             text PRIMARY KEY,
    service_status text NOT NULL
                   CHECK (service_status IN ('pending', 'active', 'suspended', 'terminated'))
);
"#;

const JOB_COLUMNS: &str =
    "id, type, related_type, related_id, status, try_count, not_before, created_at, created_by, data";

/// Postgres-backed job store.
///
/// `Send + Sync`; all statements go through the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `jobs` and `channels` tables if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), StoreError> {
        tx.rollback().await.map_err(|e| map_sqlx_error("rollback", e))
    }

    #[instrument(
        skip(self, tx, job),
        fields(job_id = %job.id, job_type = %job.job_type, related_id = %job.related_id),
        err
    )]
    async fn insert_job(&self, tx: &mut Self::Tx, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, type, related_type, related_id, status,
                try_count, not_before, created_at, created_by, data
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.job_type)
        .bind(&job.related_type)
        .bind(&job.related_id)
        .bind(job.status.as_str())
        .bind(try_count_to_db(job.try_count))
        .bind(job.not_before)
        .bind(job.created_at)
        .bind(&job.created_by)
        .bind(&job.data)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_job", e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(skip(self, tx), fields(job_id = %id), err)]
    async fn find_job_for_update(
        &self,
        tx: &mut Self::Tx,
        id: JobId,
    ) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("find_job_for_update", e))?;
        row.map(|r| decode_job(&r)).transpose()
    }

    #[instrument(
        skip(self, tx, job),
        fields(job_id = %job.id, status = %job.status),
        err
    )]
    async fn save_job(&self, tx: &mut Self::Tx, job: &Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
               SET type = $2,
                   related_type = $3,
                   related_id = $4,
                   status = $5,
                   try_count = $6,
                   not_before = $7,
                   created_by = $8,
                   data = $9
             WHERE id = $1
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.job_type)
        .bind(&job.related_type)
        .bind(&job.related_id)
        .bind(job.status.as_str())
        .bind(try_count_to_db(job.try_count))
        .bind(job.not_before)
        .bind(&job.created_by)
        .bind(&job.data)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("save_job", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(job.id));
        }
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn lock_job_slot(
        &self,
        tx: &mut Self::Tx,
        related_id: &str,
        job_type: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1 || ':' || $2))")
            .bind(related_id)
            .bind(job_type)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_job_slot", e))?;
        Ok(())
    }

    #[instrument(skip(self, tx), err)]
    async fn active_jobs(
        &self,
        tx: &mut Self::Tx,
        related_id: &str,
        job_type: Option<&str>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM jobs
             WHERE status = $1
               AND related_id = $2
               AND ($3::text IS NULL OR type = $3)
             ORDER BY created_at, id
            "#
        ))
        .bind(JobStatus::Active.as_str())
        .bind(related_id)
        .bind(job_type)
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("active_jobs", e))?;
        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self, tx), err)]
    async fn cancel_active_jobs(
        &self,
        tx: &mut Self::Tx,
        related_id: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE jobs SET status = $1 WHERE status = $2 AND related_id = $3")
            .bind(JobStatus::Canceled.as_str())
            .bind(JobStatus::Active.as_str())
            .bind(related_id)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("cancel_active_jobs", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn collect(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM (
                SELECT DISTINCT ON (related_id) *
                  FROM jobs
                 WHERE status = $1
                 ORDER BY related_id, created_at, id
            ) AS oldest
             WHERE not_before <= $2
             LIMIT $3
            "#
        ))
        .bind(JobStatus::Active.as_str())
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("collect", e))?;
        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn jobs_for(&self, related_id: &str) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE related_id = $1 ORDER BY created_at, id"
        ))
        .bind(related_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs_for", e))?;
        rows.iter().map(decode_job).collect()
    }

    #[instrument(skip(self), err)]
    async fn reactivate_failed(&self, job_type: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = $1, try_count = 0 WHERE status = $2 AND type = $3",
        )
        .bind(JobStatus::Active.as_str())
        .bind(JobStatus::Failed.as_str())
        .bind(job_type)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("reactivate_failed", e))?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ServiceStore for PostgresJobStore {
    #[instrument(skip(self, tx), err)]
    async fn lock_service_status(
        &self,
        tx: &mut Self::Tx,
        entity_id: &str,
    ) -> Result<Option<ServiceStatus>, StoreError> {
        let row = sqlx::query("SELECT service_status FROM channels WHERE id = $1 FOR UPDATE")
            .bind(entity_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("lock_service_status", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row
            .try_get("service_status")
            .map_err(|e| map_sqlx_error("lock_service_status", e))?;
        status
            .parse()
            .map(Some)
            .map_err(|e: steward_core::DomainError| StoreError::InvalidRow(e.to_string()))
    }

    #[instrument(skip(self, tx), err)]
    async fn set_service_status(
        &self,
        tx: &mut Self::Tx,
        entity_id: &str,
        status: ServiceStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO channels (id, service_status) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET service_status = EXCLUDED.service_status
            "#,
        )
        .bind(entity_id)
        .bind(status.as_str())
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("set_service_status", e))?;
        Ok(())
    }
}

pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => StoreError::InvalidRow(msg),
                _ => StoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) => {
            StoreError::InvalidRow(format!("in {}: {}", operation, err))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn try_count_to_db(try_count: u32) -> i32 {
    i32::try_from(try_count).unwrap_or(i32::MAX)
}

fn decode_job(row: &PgRow) -> Result<Job, StoreError> {
    let row = JobRow::from_row(row)
        .map_err(|e| StoreError::InvalidRow(format!("failed to deserialize job row: {}", e)))?;
    Job::try_from(row)
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    job_type: String,
    related_type: String,
    related_id: String,
    status: String,
    try_count: i32,
    not_before: DateTime<Utc>,
    created_at: DateTime<Utc>,
    created_by: String,
    data: serde_json::Value,
}

impl<'r> FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("type")?,
            related_type: row.try_get("related_type")?,
            related_id: row.try_get("related_id")?,
            status: row.try_get("status")?,
            try_count: row.try_get("try_count")?,
            not_before: row.try_get("not_before")?,
            created_at: row.try_get("created_at")?,
            created_by: row.try_get("created_by")?,
            data: row.try_get("data")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e: steward_core::DomainError| StoreError::InvalidRow(e.to_string()))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            related_type: row.related_type,
            related_id: row.related_id,
            status,
            try_count: u32::try_from(row.try_count).unwrap_or_default(),
            not_before: row.not_before,
            created_at: row.created_at,
            created_by: row.created_by,
            data: row.data,
        })
    }
}

#[cfg(test)]
mod tests {
    //! Run with `STEWARD_TEST_DATABASE_URL=postgres://... cargo test -- --ignored`.

    use super::*;

    async fn test_store() -> Option<PostgresJobStore> {
        let url = std::env::var("STEWARD_TEST_DATABASE_URL").ok()?;
        let pool = PgPool::connect(&url).await.expect("connect to test database");
        let store = PostgresJobStore::new(pool);
        store.migrate().await.expect("migrate");
        Some(store)
    }

    fn entity() -> String {
        format!("pg-test-{}", uuid::Uuid::now_v7())
    }

    #[tokio::test]
    #[ignore = "requires STEWARD_TEST_DATABASE_URL"]
    async fn insert_find_and_save_round_trip() {
        let Some(store) = test_store().await else {
            return;
        };
        let mut job = Job::new("t", "channel", entity(), "user")
            .with_data(serde_json::json!({"ethereumLog": {"transactionHash": "0x1"}}));

        let mut tx = store.begin().await.unwrap();
        store.insert_job(&mut tx, &job).await.unwrap();
        store.commit(tx).await.unwrap();

        let loaded = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.external_tx_id(), Some("0x1"));
        assert_eq!(loaded.status, JobStatus::Active);

        job.mark_done();
        let mut tx = store.begin().await.unwrap();
        store.save_job(&mut tx, &job).await.unwrap();
        store.commit(tx).await.unwrap();
        let loaded = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Done);
    }

    #[tokio::test]
    #[ignore = "requires STEWARD_TEST_DATABASE_URL"]
    async fn collect_returns_oldest_due_job_per_entity() {
        let Some(store) = test_store().await else {
            return;
        };
        let related = entity();
        let now = Utc::now();
        let mut first = Job::new("t", "channel", related.clone(), "user");
        first.created_at = now - chrono::Duration::seconds(10);
        first.not_before = first.created_at;
        let mut second = Job::new("t", "channel", related.clone(), "user");
        second.created_at = now - chrono::Duration::seconds(5);
        second.not_before = second.created_at;

        let mut tx = store.begin().await.unwrap();
        store.insert_job(&mut tx, &second).await.unwrap();
        store.insert_job(&mut tx, &first).await.unwrap();
        store.commit(tx).await.unwrap();

        let collected = store.collect(now, 10_000).await.unwrap();
        let ours: Vec<_> = collected.iter().filter(|j| j.related_id == related).collect();
        assert_eq!(ours.len(), 1);
        assert_eq!(ours[0].id, first.id);
    }

    #[tokio::test]
    #[ignore = "requires STEWARD_TEST_DATABASE_URL"]
    async fn service_status_is_locked_and_cancel_is_transactional() {
        let Some(store) = test_store().await else {
            return;
        };
        let related = entity();
        let job = Job::new("t", "channel", related.clone(), "user");

        let mut tx = store.begin().await.unwrap();
        store
            .set_service_status(&mut tx, &related, ServiceStatus::Active)
            .await
            .unwrap();
        store.insert_job(&mut tx, &job).await.unwrap();
        store.commit(tx).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let status = store.lock_service_status(&mut tx, &related).await.unwrap();
        assert_eq!(status, Some(ServiceStatus::Active));
        assert_eq!(store.cancel_active_jobs(&mut tx, &related).await.unwrap(), 1);
        store.rollback(tx).await.unwrap();

        let loaded = store.find_job(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Active);
    }

    #[tokio::test]
    #[ignore = "requires STEWARD_TEST_DATABASE_URL"]
    async fn concurrent_adds_for_one_slot_see_each_other() {
        use crate::jobs::{HandlerRegistry, Queue, QueueConfig, QueueError};

        let Some(store) = test_store().await else {
            return;
        };
        let queue = Queue::new(QueueConfig::default(), Arc::new(store), HandlerRegistry::new());
        let related = entity();

        let mut tx = queue.store().begin().await.unwrap();
        queue
            .add_in_tx(&mut tx, Job::new("t", "channel", related.clone(), "user"))
            .await
            .unwrap();

        let second = {
            let queue = queue.clone();
            let related = related.clone();
            tokio::spawn(async move { queue.add_simple("t", "channel", &related, "user").await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!second.is_finished(), "second add must wait for the first transaction");

        queue.store().commit(tx).await.unwrap();
        let err = second.await.unwrap().unwrap_err();
        assert!(matches!(err, QueueError::DuplicatedJob));
        assert_eq!(queue.store().jobs_for(&related).await.unwrap().len(), 1);
    }
}
