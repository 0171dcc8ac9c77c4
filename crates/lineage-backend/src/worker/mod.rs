//! Workers
//!
//! A worker executes exactly one claimed job. [`run_worker`] wraps the
//! worker's `work()` so that interrupts, processor failures, other errors and
//! panics are all handled in one place and never take the host down.

pub mod interrupt;

use async_trait::async_trait;
use futures::FutureExt;
use std::any::Any;
use std::cell::RefCell;
use std::panic::AssertUnwindSafe;
use std::sync::Once;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::dataset::DatasetError;
use crate::processor::trace::capture_trail;
use crate::processor::ProcessorFailure;
use crate::queue::{Job, JobQueue, QueueError};

pub use interrupt::{InterruptHandle, InterruptLevel};

/// Job status recorded when a processor fails
pub const STATUS_CRASHED: &str = "Crash during processing";

/// Errors that end a worker run
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker interrupted ({0})")]
    Interrupted(InterruptLevel),

    #[error(transparent)]
    Processor(#[from] ProcessorFailure),

    #[error("{source}")]
    Queue { source: QueueError, trail: String },

    #[error("{source}")]
    Dataset { source: DatasetError, trail: String },
}

impl WorkerError {
    /// Where the error entered the worker, if known
    pub fn trail(&self) -> Option<&str> {
        match self {
            Self::Interrupted(_) => None,
            Self::Processor(failure) => Some(&failure.trail),
            Self::Queue { trail, .. } | Self::Dataset { trail, .. } => Some(trail),
        }
    }
}

impl From<QueueError> for WorkerError {
    fn from(source: QueueError) -> Self {
        Self::Queue {
            source,
            trail: capture_trail(),
        }
    }
}

impl From<DatasetError> for WorkerError {
    fn from(source: DatasetError) -> Self {
        Self::Dataset {
            source,
            trail: capture_trail(),
        }
    }
}

/// What happened to a worker run, for the caller's bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Completed,
    Interrupted(InterruptLevel),
    Crashed,
}

/// An execution unit bound to one job
#[async_trait]
pub trait Worker: Send {
    fn job(&self) -> &Job;

    async fn work(&mut self) -> Result<(), WorkerError>;

    /// Clean up after an interrupt; job bookkeeping is done by the caller
    async fn abort(&mut self) -> Result<(), WorkerError>;
}

/// Shared settings for [`run_worker`]
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: JobQueue,
    pub interrupt_retry_secs: i64,
}

thread_local! {
    static PANIC_TRAIL: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chain a panic hook that remembers where the last panic on this thread happened
fn install_panic_trail_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            record_panic_trail();
            previous(info);
        }));
    });
}

fn record_panic_trail() {
    let trail = capture_trail();
    PANIC_TRAIL.with(|slot| *slot.borrow_mut() = Some(trail));
}

fn take_panic_trail() -> String {
    PANIC_TRAIL
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| "unavailable".to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run a worker to completion, containing every failure mode
pub async fn run_worker<W: Worker>(mut worker: W, ctx: WorkerContext) -> WorkerOutcome {
    let job_id = worker.job().id;
    let jobtype = worker.job().jobtype.clone();

    install_panic_trail_hook();
    let result = AssertUnwindSafe(worker.work()).catch_unwind().await;

    let crash = match result {
        Ok(Ok(())) => return WorkerOutcome::Completed,
        Ok(Err(WorkerError::Interrupted(level))) => {
            info!(job_id, jobtype = %jobtype, level = %level, "Worker interrupted");
            handle_interrupt(&mut worker, &ctx, level).await;
            return WorkerOutcome::Interrupted(level);
        },
        Ok(Err(WorkerError::Processor(failure))) => {
            error!(
                job_id,
                jobtype = %jobtype,
                processor_type = %failure.processor_type,
                dataset_key = %failure.dataset_key,
                parent_key = failure.parent_key.as_deref().unwrap_or(""),
                trail = %failure.trail,
                error = %failure.source,
                "Processor crashed"
            );
            format!("{}: {} (at {})", STATUS_CRASHED, failure.source, failure.trail)
        },
        Ok(Err(other)) => {
            let trail = other.trail().unwrap_or("unavailable");
            error!(job_id, jobtype = %jobtype, error = %other, trail = %trail, "Worker failed");
            format!("{}: {} (at {})", STATUS_CRASHED, other, trail)
        },
        Err(payload) => {
            // the hook ran on this thread right before unwinding started
            let trail = take_panic_trail();
            let message = panic_message(payload.as_ref());
            error!(job_id, jobtype = %jobtype, panic = %message, trail = %trail, "Worker panicked");
            format!("{}: panic: {} (at {})", STATUS_CRASHED, message, trail)
        },
    };

    // The job stays claimed; an operator or restart decides what happens next
    let mut job = worker.job().clone();
    if let Err(e) = ctx.queue.add_status(&mut job, crash).await {
        warn!(job_id, error = %e, "Could not annotate crashed job");
    }
    WorkerOutcome::Crashed
}

async fn handle_interrupt<W: Worker>(worker: &mut W, ctx: &WorkerContext, level: InterruptLevel) {
    let mut job = worker.job().clone();
    let result = match level {
        InterruptLevel::Retry => {
            ctx.queue
                .release(&mut job, ctx.interrupt_retry_secs, 0)
                .await
        },
        InterruptLevel::Cancel => ctx.queue.finish(&mut job).await,
    };
    if let Err(e) = result {
        warn!(job_id = job.id, error = %e, "Could not update interrupted job");
    }

    if let Err(e) = worker.abort().await {
        warn!(job_id = job.id, error = %e, "Worker abort hook failed");
    }
}
