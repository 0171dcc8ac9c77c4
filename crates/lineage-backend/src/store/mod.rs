//! Row store
//!
//! Persistence for the two row collections the backend needs, `jobs` and
//! `datasets`. Everything above this layer (queue, datasets, workers) talks
//! to a `dyn Store`, so the PostgreSQL store and the in-memory store are
//! interchangeable.
//!
//! Job claiming is the only compare-and-set operation: [`Store::claim_job`]
//! must succeed for at most one caller while `timestamp_claimed` is 0.
//! Dataset updates are last-write-wins.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde_json::Value;

use crate::db::DbResult;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Row in the `jobs` collection
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct JobRow {
    pub id: i64,
    pub jobtype: String,
    pub remote_id: String,
    pub details: Value,
    /// JSON array of status messages, oldest first
    pub status: String,
    pub attempts: i32,
    pub interval: i64,
    pub timestamp: i64,
    pub timestamp_claimed: i64,
    pub timestamp_lastclaimed: i64,
    pub timestamp_after: i64,
}

impl JobRow {
    /// Whether the job may be claimed at unix time `now`
    pub fn is_claimable_at(&self, now: i64) -> bool {
        self.timestamp_claimed == 0
            && self.timestamp_after <= now
            && (self.interval == 0 || self.timestamp_lastclaimed + self.interval <= now)
    }
}

/// Values for a job insert; the store assigns the id
#[derive(Debug, Clone)]
pub struct NewJobRow {
    pub jobtype: String,
    pub remote_id: String,
    pub details: Value,
    pub interval: i64,
    pub timestamp: i64,
    pub timestamp_after: i64,
}

/// Row in the `datasets` collection
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DatasetRow {
    pub key: String,
    #[sqlx(rename = "type")]
    pub dataset_type: String,
    pub key_parent: Option<String>,
    pub query: String,
    pub parameters: Value,
    pub result_file: String,
    pub status: String,
    pub is_finished: bool,
    pub num_rows: i64,
    pub progress: f64,
    pub timestamp: i64,
    pub software_version: String,
    pub owner: String,
    pub is_private: bool,
}

/// Filter for [`Store::fetch_jobs`]
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub jobtype: Option<String>,
    pub remote_id: Option<String>,
    /// Only jobs claimable at this unix time
    pub claimable_at: Option<i64>,
}

impl JobFilter {
    pub fn jobtype(mut self, jobtype: impl Into<String>) -> Self {
        self.jobtype = Some(jobtype.into());
        self
    }

    pub fn remote_id(mut self, remote_id: impl Into<String>) -> Self {
        self.remote_id = Some(remote_id.into());
        self
    }

    pub fn claimable_at(mut self, now: i64) -> Self {
        self.claimable_at = Some(now);
        self
    }

    pub fn matches(&self, row: &JobRow) -> bool {
        self.jobtype.as_deref().map_or(true, |t| t == row.jobtype)
            && self.remote_id.as_deref().map_or(true, |r| r == row.remote_id)
            && self.claimable_at.map_or(true, |now| row.is_claimable_at(now))
    }
}

/// Persistence backend for jobs and datasets
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a job; `DbError::Duplicate` if `(jobtype, remote_id)` is taken
    async fn insert_job(&self, job: NewJobRow) -> DbResult<JobRow>;

    async fn fetch_job(&self, id: i64) -> DbResult<Option<JobRow>>;

    async fn fetch_job_by_remote_id(&self, jobtype: &str, remote_id: &str)
        -> DbResult<Option<JobRow>>;

    /// Jobs matching `filter`, oldest first
    async fn fetch_jobs(&self, filter: &JobFilter) -> DbResult<Vec<JobRow>>;

    /// Set the claim timestamps if and only if the job is unclaimed.
    /// Returns whether a row was updated.
    async fn claim_job(&self, id: i64, claimed_at: i64) -> DbResult<bool>;

    /// Unclaim, bump `attempts` and set `timestamp_after`
    async fn release_job(&self, id: i64, claim_after: i64) -> DbResult<bool>;

    /// Unclaim without touching `attempts`
    async fn reset_job(&self, id: i64) -> DbResult<bool>;

    async fn update_job_status(&self, id: i64, status: &str) -> DbResult<bool>;

    async fn delete_job(&self, id: i64) -> DbResult<bool>;

    async fn delete_jobs_by_remote_id(&self, remote_id: &str) -> DbResult<u64>;

    /// Unclaim every claimed job; returns the number released
    async fn release_claimed_jobs(&self) -> DbResult<u64>;

    /// Insert a dataset; `DbError::Duplicate` if the key is taken
    async fn insert_dataset(&self, row: &DatasetRow) -> DbResult<()>;

    async fn fetch_dataset(&self, key: &str) -> DbResult<Option<DatasetRow>>;

    /// Dataset whose parameters reference job `job_id`
    async fn fetch_dataset_by_job(&self, job_id: i64) -> DbResult<Option<DatasetRow>>;

    async fn fetch_children(&self, key: &str) -> DbResult<Vec<DatasetRow>>;

    /// Overwrite the stored row with the same key
    async fn update_dataset(&self, row: &DatasetRow) -> DbResult<bool>;

    async fn delete_dataset(&self, key: &str) -> DbResult<bool>;
}

/// Does `parameters.job` point at `job_id`? Stored as number or string.
pub(crate) fn references_job(parameters: &Value, job_id: i64) -> bool {
    match parameters.get("job") {
        Some(Value::Number(n)) => n.as_i64() == Some(job_id),
        Some(Value::String(s)) => s == &job_id.to_string(),
        _ => false,
    }
}
