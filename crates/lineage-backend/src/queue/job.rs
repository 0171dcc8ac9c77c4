//! Job snapshot and insert request

use serde_json::{Map, Value};

use crate::store::JobRow;

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// In-memory view of one row in the `jobs` collection.
///
/// A `Job` is a snapshot. Queue operations that change the row also update
/// the snapshot they were handed, so a worker holding its job sees its own
/// claim and status history without re-reading the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: i64,
    pub jobtype: String,
    pub remote_id: String,
    pub details: Value,
    pub status: Vec<String>,
    pub attempts: i32,
    pub interval: i64,
    pub timestamp: i64,
    pub timestamp_claimed: i64,
    pub timestamp_lastclaimed: i64,
    pub timestamp_after: i64,
}

impl Job {
    pub fn is_recurring(&self) -> bool {
        self.interval > 0
    }

    pub fn is_claimed(&self) -> bool {
        self.timestamp_claimed > 0
    }

    /// A value from the job's `details` object
    pub fn detail(&self, name: &str) -> Option<&Value> {
        self.details.get(name)
    }

    /// Most recent status message
    pub fn last_status(&self) -> Option<&str> {
        self.status.last().map(String::as_str)
    }
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        // Rows written by other tools may carry a bare string instead of a list
        let status = match serde_json::from_str::<Vec<String>>(&row.status) {
            Ok(list) => list,
            Err(_) if row.status.is_empty() => Vec::new(),
            Err(_) => vec![row.status.clone()],
        };

        Self {
            id: row.id,
            jobtype: row.jobtype,
            remote_id: row.remote_id,
            details: row.details,
            status,
            attempts: row.attempts,
            interval: row.interval,
            timestamp: row.timestamp,
            timestamp_claimed: row.timestamp_claimed,
            timestamp_lastclaimed: row.timestamp_lastclaimed,
            timestamp_after: row.timestamp_after,
        }
    }
}

/// Request to add a job to the queue
#[derive(Debug, Clone)]
pub struct NewJob {
    pub jobtype: String,
    pub remote_id: String,
    pub details: Value,
    pub interval: i64,
    pub claim_after: i64,
    pub allow_duplicate: bool,
}

impl NewJob {
    pub fn new(jobtype: impl Into<String>, remote_id: impl Into<String>) -> Self {
        Self {
            jobtype: jobtype.into(),
            remote_id: remote_id.into(),
            details: Value::Object(Map::new()),
            interval: 0,
            claim_after: 0,
            allow_duplicate: false,
        }
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Make the job recurring, firing every `seconds`
    pub fn interval(mut self, seconds: i64) -> Self {
        self.interval = seconds.max(0);
        self
    }

    /// Do not hand the job out before this unix time
    pub fn claim_after(mut self, timestamp: i64) -> Self {
        self.claim_after = timestamp;
        self
    }

    /// Return the outstanding job instead of failing when one already exists
    pub fn allow_duplicate(mut self, allow: bool) -> Self {
        self.allow_duplicate = allow;
        self
    }
}
