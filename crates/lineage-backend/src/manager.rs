//! Worker manager
//!
//! Polls the queue and starts a [`ProcessorRunner`] for every claimable job
//! whose processor type is below its `max_workers` ceiling. Each runner gets
//! its own tokio task and interrupt handle.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::processor::{ProcessorRunner, RunnerEnv};
use crate::queue::{QueueError, QueueResult};
use crate::worker::{run_worker, InterruptHandle, InterruptLevel, WorkerContext};

struct RunningJob {
    jobtype: String,
    interrupt: InterruptHandle,
    handle: JoinHandle<()>,
}

type RunningJobs = Arc<Mutex<HashMap<i64, RunningJob>>>;

/// Dispatcher for processor jobs
pub struct WorkerManager {
    env: RunnerEnv,
    running: RunningJobs,
    shutdown: CancellationToken,
}

/// Control handle for a [`WorkerManager`] that has been started
#[derive(Clone)]
pub struct ManagerHandle {
    running: RunningJobs,
    shutdown: CancellationToken,
}

impl WorkerManager {
    pub fn new(env: RunnerEnv) -> Self {
        Self {
            env,
            running: Arc::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            running: self.running.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run the dispatch loop in the background
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                error!(error = %e, "Worker manager stopped with an error");
            }
        })
    }

    /// Dispatch until shut down, then wait for running jobs
    pub async fn run(&self) -> QueueResult<()> {
        info!(
            processors = self.env.registry.len(),
            poll_interval_ms = self.env.config.poll_interval_ms,
            "Worker manager started"
        );
        self.env.queue.release_all().await?;

        loop {
            if let Err(e) = self.dispatch_once().await {
                error!(error = %e, "Dispatch pass failed");
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep(self.env.config.poll_interval()) => {},
            }
        }

        info!("Worker manager shutting down, interrupting running jobs");
        let handle = self.handle();
        handle.interrupt_all(InterruptLevel::Retry).await;
        handle.join_all().await;
        info!("Worker manager stopped");
        Ok(())
    }

    /// One pass over all processor types; returns the number of jobs started
    pub async fn dispatch_once(&self) -> QueueResult<usize> {
        // count active workers per type without holding the lock across queue calls
        let active: HashMap<String, usize> = {
            let mut running = self.running.lock().await;
            running.retain(|_, job| !job.handle.is_finished());
            running.values().fold(HashMap::new(), |mut counts, job| {
                *counts.entry(job.jobtype.clone()).or_default() += 1;
                counts
            })
        };

        let mut started = 0;
        for processor in self.env.registry.iter() {
            let info = processor.info();
            let active = active.get(&info.processor_type).copied().unwrap_or(0);
            if active >= info.max_workers {
                continue;
            }

            let jobs = self
                .env
                .queue
                .claimable_jobs(Some(&info.processor_type))
                .await?;

            for mut job in jobs.into_iter().take(info.max_workers - active) {
                match self.env.queue.claim(&mut job).await {
                    Ok(()) => {},
                    Err(QueueError::JobClaimed(id)) => {
                        debug!(job_id = id, "Job claimed elsewhere, skipping");
                        continue;
                    },
                    Err(e) => return Err(e),
                }

                let interrupt = InterruptHandle::new();
                let runner = ProcessorRunner::new(
                    job.clone(),
                    processor.clone(),
                    self.env.clone(),
                    interrupt.clone(),
                );
                let ctx = WorkerContext {
                    queue: self.env.queue.clone(),
                    interrupt_retry_secs: self.env.config.interrupt_retry_secs,
                };

                let job_id = job.id;
                let jobtype = job.jobtype.clone();
                let handle = tokio::spawn(async move {
                    let outcome = run_worker(runner, ctx).await;
                    debug!(job_id, outcome = ?outcome, "Worker finished");
                });

                info!(job_id, jobtype = %jobtype, remote_id = %job.remote_id, "Started worker");
                self.running.lock().await.insert(
                    job_id,
                    RunningJob {
                        jobtype,
                        interrupt,
                        handle,
                    },
                );
                started += 1;
            }
        }

        Ok(started)
    }
}

impl ManagerHandle {
    /// Ask a running job to stop; returns whether the job was running here
    pub async fn interrupt(&self, job_id: i64, level: InterruptLevel) -> bool {
        match self.running.lock().await.get(&job_id) {
            Some(job) => {
                info!(job_id, level = %level, "Interrupt requested");
                job.interrupt.request(level);
                true
            },
            None => false,
        }
    }

    pub async fn interrupt_all(&self, level: InterruptLevel) {
        for job in self.running.lock().await.values() {
            job.interrupt.request(level);
        }
    }

    /// Ids of jobs with a live worker task
    pub async fn running_jobs(&self) -> Vec<i64> {
        let running = self.running.lock().await;
        let mut ids: Vec<i64> = running
            .iter()
            .filter(|(_, job)| !job.handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Wait for every worker task started so far
    pub async fn join_all(&self) {
        let handles: Vec<(i64, JoinHandle<()>)> = self
            .running
            .lock()
            .await
            .drain()
            .map(|(id, job)| (id, job.handle))
            .collect();

        for (job_id, handle) in handles {
            if let Err(e) = handle.await {
                warn!(job_id, error = %e, "Worker task did not complete cleanly");
            }
        }
    }

    /// Stop dispatching; the run loop then drains running jobs
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
