//! PostgreSQL store
//!
//! Tables are created by the workspace migrations. Queries use the runtime
//! `sqlx::query*` API so the crate builds without a live database.

use async_trait::async_trait;
use sqlx::PgPool;

use super::{DatasetRow, JobFilter, JobRow, NewJobRow, Store};
use crate::db::{DbError, DbResult};

const JOB_COLUMNS: &str = r#"id, jobtype, remote_id, details, status, attempts, "interval",
    timestamp, timestamp_claimed, timestamp_lastclaimed, timestamp_after"#;

const DATASET_COLUMNS: &str = r#"key, type, key_parent, query, parameters, result_file, status,
    is_finished, num_rows, progress, timestamp, software_version, owner, is_private"#;

/// Store backed by a PostgreSQL pool
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_job(&self, job: NewJobRow) -> DbResult<JobRow> {
        let identity = format!("{}/{}", job.jobtype, job.remote_id);
        let sql = format!(
            r#"
            INSERT INTO jobs (jobtype, remote_id, details, status, attempts, "interval",
                              timestamp, timestamp_claimed, timestamp_lastclaimed, timestamp_after)
            VALUES ($1, $2, $3, '[]', 0, $4, $5, 0, 0, $6)
            RETURNING {JOB_COLUMNS}
            "#
        );

        sqlx::query_as::<_, JobRow>(&sql)
            .bind(&job.jobtype)
            .bind(&job.remote_id)
            .bind(&job.details)
            .bind(job.interval)
            .bind(job.timestamp)
            .bind(job.timestamp_after)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbError::from_insert(e, "Job", &identity))
    }

    async fn fetch_job(&self, id: i64) -> DbResult<Option<JobRow>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, JobRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn fetch_job_by_remote_id(
        &self,
        jobtype: &str,
        remote_id: &str,
    ) -> DbResult<Option<JobRow>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE jobtype = $1 AND remote_id = $2");
        Ok(sqlx::query_as::<_, JobRow>(&sql)
            .bind(jobtype)
            .bind(remote_id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn fetch_jobs(&self, filter: &JobFilter) -> DbResult<Vec<JobRow>> {
        // NULL parameters disable the corresponding predicate
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::text IS NULL OR jobtype = $1)
              AND ($2::text IS NULL OR remote_id = $2)
              AND ($3::bigint IS NULL OR (
                    timestamp_claimed = 0
                AND timestamp_after <= $3
                AND ("interval" = 0 OR timestamp_lastclaimed + "interval" <= $3)))
            ORDER BY timestamp ASC, id ASC
            "#
        );

        Ok(sqlx::query_as::<_, JobRow>(&sql)
            .bind(filter.jobtype.as_deref())
            .bind(filter.remote_id.as_deref())
            .bind(filter.claimable_at)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn claim_job(&self, id: i64, claimed_at: i64) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET timestamp_claimed = $2, timestamp_lastclaimed = $2
            WHERE id = $1 AND timestamp_claimed = 0
            "#,
        )
        .bind(id)
        .bind(claimed_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_job(&self, id: i64, claim_after: i64) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET timestamp_claimed = 0, attempts = attempts + 1, timestamp_after = $2
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(claim_after)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn reset_job(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query("UPDATE jobs SET timestamp_claimed = 0 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn update_job_status(&self, id: i64, status: &str) -> DbResult<bool> {
        let result = sqlx::query("UPDATE jobs SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_job(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_jobs_by_remote_id(&self, remote_id: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE remote_id = $1")
            .bind(remote_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn release_claimed_jobs(&self) -> DbResult<u64> {
        let result = sqlx::query("UPDATE jobs SET timestamp_claimed = 0 WHERE timestamp_claimed > 0")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_dataset(&self, row: &DatasetRow) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO datasets (key, type, key_parent, query, parameters, result_file, status,
                                  is_finished, num_rows, progress, timestamp, software_version,
                                  owner, is_private)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&row.key)
        .bind(&row.dataset_type)
        .bind(&row.key_parent)
        .bind(&row.query)
        .bind(&row.parameters)
        .bind(&row.result_file)
        .bind(&row.status)
        .bind(row.is_finished)
        .bind(row.num_rows)
        .bind(row.progress)
        .bind(row.timestamp)
        .bind(&row.software_version)
        .bind(&row.owner)
        .bind(row.is_private)
        .execute(&self.pool)
        .await
        .map_err(|e| DbError::from_insert(e, "Dataset", &row.key))?;

        Ok(())
    }

    async fn fetch_dataset(&self, key: &str) -> DbResult<Option<DatasetRow>> {
        let sql = format!("SELECT {DATASET_COLUMNS} FROM datasets WHERE key = $1");
        Ok(sqlx::query_as::<_, DatasetRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn fetch_dataset_by_job(&self, job_id: i64) -> DbResult<Option<DatasetRow>> {
        let sql = format!(
            "SELECT {DATASET_COLUMNS} FROM datasets WHERE parameters->>'job' = $1 LIMIT 1"
        );
        Ok(sqlx::query_as::<_, DatasetRow>(&sql)
            .bind(job_id.to_string())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn fetch_children(&self, key: &str) -> DbResult<Vec<DatasetRow>> {
        let sql = format!(
            "SELECT {DATASET_COLUMNS} FROM datasets WHERE key_parent = $1 ORDER BY timestamp ASC"
        );
        Ok(sqlx::query_as::<_, DatasetRow>(&sql)
            .bind(key)
            .fetch_all(&self.pool)
            .await?)
    }

    async fn update_dataset(&self, row: &DatasetRow) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE datasets
            SET type = $2, key_parent = $3, query = $4, parameters = $5, result_file = $6,
                status = $7, is_finished = $8, num_rows = $9, progress = $10, timestamp = $11,
                software_version = $12, owner = $13, is_private = $14
            WHERE key = $1
            "#,
        )
        .bind(&row.key)
        .bind(&row.dataset_type)
        .bind(&row.key_parent)
        .bind(&row.query)
        .bind(&row.parameters)
        .bind(&row.result_file)
        .bind(&row.status)
        .bind(row.is_finished)
        .bind(row.num_rows)
        .bind(row.progress)
        .bind(row.timestamp)
        .bind(&row.software_version)
        .bind(&row.owner)
        .bind(row.is_private)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_dataset(&self, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM datasets WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
