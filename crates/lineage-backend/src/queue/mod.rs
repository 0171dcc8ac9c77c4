//! Job queue
//!
//! Add, claim, release and finish jobs in the `jobs` collection. Claiming is
//! a compare-and-set on `timestamp_claimed`, so at most one worker holds a
//! job at any time. Recurring jobs (`interval > 0`) are never deleted; on
//! finish they become claimable again once their interval has elapsed.

pub mod job;

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::db::DbError;
use crate::store::{JobFilter, NewJobRow, Store};

pub use job::{unix_now, Job, NewJob};

/// Job queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    /// Another worker claimed the job first
    #[error("Job {0} has already been claimed")]
    JobClaimed(i64),

    #[error("Job {0} not found")]
    JobNotFound(String),

    /// An outstanding job with the same type and remote id exists
    #[error("Job '{jobtype}' for '{remote_id}' already exists")]
    JobAlreadyExists { jobtype: String, remote_id: String },

    #[error(transparent)]
    Db(#[from] DbError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Scheduler-facing interface to the `jobs` collection
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn Store>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Add a job to the queue
    pub async fn add(&self, job: NewJob) -> QueueResult<Job> {
        let row = NewJobRow {
            jobtype: job.jobtype.clone(),
            remote_id: job.remote_id.clone(),
            details: job.details,
            interval: job.interval,
            timestamp: unix_now(),
            timestamp_after: job.claim_after,
        };

        match self.store.insert_job(row).await {
            Ok(row) => {
                debug!(job_id = row.id, jobtype = %row.jobtype, remote_id = %row.remote_id, "Job queued");
                Ok(Job::from(row))
            },
            Err(DbError::Duplicate(_)) if job.allow_duplicate => self
                .get_job_by_remote_id(&job.jobtype, &job.remote_id)
                .await,
            Err(DbError::Duplicate(_)) => Err(QueueError::JobAlreadyExists {
                jobtype: job.jobtype,
                remote_id: job.remote_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Claim a job for the calling worker
    ///
    /// Fails with [`QueueError::JobClaimed`] if someone else got there first.
    pub async fn claim(&self, job: &mut Job) -> QueueResult<()> {
        let now = unix_now();
        let claimed_at = if job.is_recurring() {
            now - now % job.interval
        } else {
            now
        };

        if !self.store.claim_job(job.id, claimed_at).await? {
            return Err(QueueError::JobClaimed(job.id));
        }

        job.timestamp_claimed = claimed_at;
        job.timestamp_lastclaimed = claimed_at;
        Ok(())
    }

    /// Hand a claimed job back to the queue
    ///
    /// The job becomes claimable `delay` seconds from now, or at
    /// `claim_after` when no delay is given.
    pub async fn release(&self, job: &mut Job, delay: i64, claim_after: i64) -> QueueResult<()> {
        let after = if delay > 0 {
            unix_now() + delay
        } else {
            claim_after
        };

        if !self.store.release_job(job.id, after).await? {
            return Err(QueueError::JobNotFound(job.id.to_string()));
        }

        job.timestamp_claimed = 0;
        job.timestamp_after = after;
        job.attempts += 1;
        Ok(())
    }

    /// Mark a job as done
    ///
    /// One-shot jobs are deleted; recurring jobs are reset to unclaimed.
    pub async fn finish(&self, job: &mut Job) -> QueueResult<()> {
        if job.is_recurring() {
            self.store.reset_job(job.id).await?;
            job.timestamp_claimed = 0;
        } else if !self.store.delete_job(job.id).await? {
            // already gone, e.g. removed together with its dataset
            debug!(job_id = job.id, "Finished job was no longer in the queue");
        }
        Ok(())
    }

    /// Append a message to the job's status list
    pub async fn add_status(&self, job: &mut Job, message: impl Into<String>) -> QueueResult<()> {
        job.status.push(message.into());
        let encoded =
            serde_json::to_string(&job.status).map_err(|e| DbError::Decode(e.to_string()))?;

        if !self.store.update_job_status(job.id, &encoded).await? {
            warn!(job_id = job.id, "Could not record status for missing job");
        }
        Ok(())
    }

    pub async fn get_job(&self, id: i64) -> QueueResult<Job> {
        self.store
            .fetch_job(id)
            .await?
            .map(Job::from)
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }

    pub async fn get_job_by_remote_id(&self, jobtype: &str, remote_id: &str) -> QueueResult<Job> {
        self.store
            .fetch_job_by_remote_id(jobtype, remote_id)
            .await?
            .map(Job::from)
            .ok_or_else(|| QueueError::JobNotFound(format!("{}/{}", jobtype, remote_id)))
    }

    /// Jobs that can be claimed right now, oldest first
    pub async fn claimable_jobs(&self, jobtype: Option<&str>) -> QueueResult<Vec<Job>> {
        self.claimable_jobs_at(jobtype, unix_now()).await
    }

    /// Jobs that can be claimed at unix time `now`, oldest first
    pub async fn claimable_jobs_at(&self, jobtype: Option<&str>, now: i64) -> QueueResult<Vec<Job>> {
        let mut filter = JobFilter::default().claimable_at(now);
        if let Some(jobtype) = jobtype {
            filter = filter.jobtype(jobtype);
        }

        let rows = self.store.fetch_jobs(&filter).await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }

    /// Every job in the queue, claimed or not, oldest first
    pub async fn all_jobs(&self, jobtype: Option<&str>) -> QueueResult<Vec<Job>> {
        let filter = match jobtype {
            Some(jobtype) => JobFilter::default().jobtype(jobtype),
            None => JobFilter::default(),
        };

        let rows = self.store.fetch_jobs(&filter).await?;
        Ok(rows.into_iter().map(Job::from).collect())
    }

    pub async fn job_count(&self, jobtype: Option<&str>) -> QueueResult<usize> {
        Ok(self.all_jobs(jobtype).await?.len())
    }

    /// Number of jobs of the same type queued before this one
    pub async fn place_in_queue(&self, job: &Job) -> QueueResult<usize> {
        let jobs = self.all_jobs(Some(&job.jobtype)).await?;

        jobs.iter()
            .position(|j| j.id == job.id)
            .ok_or_else(|| QueueError::JobNotFound(job.id.to_string()))
    }

    /// Release every claimed job
    ///
    /// Run once at start-up: any claim still present belongs to a process
    /// that is no longer running.
    pub async fn release_all(&self) -> QueueResult<u64> {
        let released = self.store.release_claimed_jobs().await?;
        if released > 0 {
            info!(released, "Released jobs claimed by a previous run");
        }
        Ok(released)
    }
}
