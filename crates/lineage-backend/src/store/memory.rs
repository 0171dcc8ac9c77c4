//! In-memory store
//!
//! Used by tests and by embedders that do not need durability. A single
//! async mutex serialises all access, which makes the claim compare-and-set
//! trivially atomic.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::{references_job, DatasetRow, JobFilter, JobRow, NewJobRow, Store};
use crate::db::{DbError, DbResult};

#[derive(Default)]
struct MemoryState {
    next_job_id: i64,
    jobs: BTreeMap<i64, JobRow>,
    datasets: BTreeMap<String, DatasetRow>,
}

/// Store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dataset rows, for assertions in tests
    pub async fn dataset_count(&self) -> usize {
        self.state.lock().await.datasets.len()
    }

    /// Number of job rows, for assertions in tests
    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }
}

fn sorted_jobs<'a>(rows: impl Iterator<Item = &'a JobRow>) -> Vec<JobRow> {
    let mut rows: Vec<JobRow> = rows.cloned().collect();
    rows.sort_by_key(|r| (r.timestamp, r.id));
    rows
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, job: NewJobRow) -> DbResult<JobRow> {
        let mut state = self.state.lock().await;

        if state
            .jobs
            .values()
            .any(|r| r.jobtype == job.jobtype && r.remote_id == job.remote_id)
        {
            return Err(DbError::duplicate(
                "Job",
                &format!("{}/{}", job.jobtype, job.remote_id),
            ));
        }

        state.next_job_id += 1;
        let row = JobRow {
            id: state.next_job_id,
            jobtype: job.jobtype,
            remote_id: job.remote_id,
            details: job.details,
            status: "[]".to_string(),
            attempts: 0,
            interval: job.interval,
            timestamp: job.timestamp,
            timestamp_claimed: 0,
            timestamp_lastclaimed: 0,
            timestamp_after: job.timestamp_after,
        };
        state.jobs.insert(row.id, row.clone());
        Ok(row)
    }

    async fn fetch_job(&self, id: i64) -> DbResult<Option<JobRow>> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn fetch_job_by_remote_id(
        &self,
        jobtype: &str,
        remote_id: &str,
    ) -> DbResult<Option<JobRow>> {
        Ok(self
            .state
            .lock()
            .await
            .jobs
            .values()
            .find(|r| r.jobtype == jobtype && r.remote_id == remote_id)
            .cloned())
    }

    async fn fetch_jobs(&self, filter: &JobFilter) -> DbResult<Vec<JobRow>> {
        let state = self.state.lock().await;
        Ok(sorted_jobs(state.jobs.values().filter(|r| filter.matches(r))))
    }

    async fn claim_job(&self, id: i64, claimed_at: i64) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(row) if row.timestamp_claimed == 0 => {
                row.timestamp_claimed = claimed_at;
                row.timestamp_lastclaimed = claimed_at;
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn release_job(&self, id: i64, claim_after: i64) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.jobs.get_mut(&id) {
            Some(row) => {
                row.timestamp_claimed = 0;
                row.attempts += 1;
                row.timestamp_after = claim_after;
                true
            },
            None => false,
        })
    }

    async fn reset_job(&self, id: i64) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.jobs.get_mut(&id) {
            Some(row) => {
                row.timestamp_claimed = 0;
                true
            },
            None => false,
        })
    }

    async fn update_job_status(&self, id: i64, status: &str) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.jobs.get_mut(&id) {
            Some(row) => {
                row.status = status.to_string();
                true
            },
            None => false,
        })
    }

    async fn delete_job(&self, id: i64) -> DbResult<bool> {
        Ok(self.state.lock().await.jobs.remove(&id).is_some())
    }

    async fn delete_jobs_by_remote_id(&self, remote_id: &str) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state.jobs.retain(|_, r| r.remote_id != remote_id);
        Ok((before - state.jobs.len()) as u64)
    }

    async fn release_claimed_jobs(&self) -> DbResult<u64> {
        let mut state = self.state.lock().await;
        let mut released = 0;
        for row in state.jobs.values_mut().filter(|r| r.timestamp_claimed > 0) {
            row.timestamp_claimed = 0;
            released += 1;
        }
        Ok(released)
    }

    async fn insert_dataset(&self, row: &DatasetRow) -> DbResult<()> {
        let mut state = self.state.lock().await;
        if state.datasets.contains_key(&row.key) {
            return Err(DbError::duplicate("Dataset", &row.key));
        }
        state.datasets.insert(row.key.clone(), row.clone());
        Ok(())
    }

    async fn fetch_dataset(&self, key: &str) -> DbResult<Option<DatasetRow>> {
        Ok(self.state.lock().await.datasets.get(key).cloned())
    }

    async fn fetch_dataset_by_job(&self, job_id: i64) -> DbResult<Option<DatasetRow>> {
        Ok(self
            .state
            .lock()
            .await
            .datasets
            .values()
            .find(|r| references_job(&r.parameters, job_id))
            .cloned())
    }

    async fn fetch_children(&self, key: &str) -> DbResult<Vec<DatasetRow>> {
        let state = self.state.lock().await;
        let mut children: Vec<DatasetRow> = state
            .datasets
            .values()
            .filter(|r| r.key_parent.as_deref() == Some(key))
            .cloned()
            .collect();
        children.sort_by_key(|r| r.timestamp);
        Ok(children)
    }

    async fn update_dataset(&self, row: &DatasetRow) -> DbResult<bool> {
        let mut state = self.state.lock().await;
        Ok(match state.datasets.get_mut(&row.key) {
            Some(stored) => {
                *stored = row.clone();
                true
            },
            None => false,
        })
    }

    async fn delete_dataset(&self, key: &str) -> DbResult<bool> {
        Ok(self.state.lock().await.datasets.remove(key).is_some())
    }
}
