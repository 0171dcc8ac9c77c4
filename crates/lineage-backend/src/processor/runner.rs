//! Processor lifecycle
//!
//! [`ProcessorRunner`] is the [`Worker`] that runs one processor job:
//!
//! 1. bind the job to its dataset (gone: finish the job quietly)
//! 2. resolve the source dataset, looking past unfinished presets
//! 3. wait for the source to finish by releasing the job
//! 4. prepare: clear the log, stamp the version, merge option defaults and
//!    drop sensitive parameters
//! 5. bail out early if an interrupt is already pending
//! 6. process, then finalize: status, finish, follow-ups, side outputs

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{
    chain, merge_defaults, preset, sensitive_options, ProcessContext, Processor, ProcessorError,
    ProcessorFailure, ProcessorRegistry,
};
use crate::config::{OrphanedPresetPolicy, WorkerConfig};
use crate::dataset::{Dataset, DatasetError, Datasets};
use crate::queue::{Job, JobQueue};
use crate::worker::{InterruptHandle, InterruptLevel, Worker, WorkerError};

pub const STATUS_PROCESSING: &str = "Processing data";
pub const STATUS_COMPLETED: &str = "Dataset completed.";
pub const STATUS_NO_DATA: &str = "Finished, no input data found.";
pub const STATUS_CRASHED: &str = "Processor crashed, see the backend log for details.";
pub const STATUS_RETRY: &str = "Processing was interrupted and will be retried shortly.";
pub const STATUS_CANCELLED: &str = "Processing was cancelled.";
pub const STATUS_PARENT_MISSING: &str = "Source dataset no longer exists.";
pub const STATUS_ORPHANED_PRESET: &str =
    "Preset chain has no source dataset; waiting for an operator.";

/// Services shared by every runner
#[derive(Clone)]
pub struct RunnerEnv {
    pub queue: JobQueue,
    pub datasets: Datasets,
    pub registry: Arc<ProcessorRegistry>,
    pub config: WorkerConfig,
}

/// Runs one processor job
pub struct ProcessorRunner {
    job: Job,
    processor: Arc<dyn Processor>,
    env: RunnerEnv,
    interrupt: InterruptHandle,
    dataset: Option<Dataset>,
}

/// Effective input of a run
struct Source {
    dataset: Option<Dataset>,
    /// At least one unfinished preset was skipped to get here
    in_preset: bool,
}

impl ProcessorRunner {
    pub fn new(
        job: Job,
        processor: Arc<dyn Processor>,
        env: RunnerEnv,
        interrupt: InterruptHandle,
    ) -> Self {
        Self {
            job,
            processor,
            env,
            interrupt,
            dataset: None,
        }
    }

    /// The dataset this run is bound to, once bound
    pub fn dataset(&self) -> Option<&Dataset> {
        self.dataset.as_ref()
    }

    fn processor_type(&self) -> &str {
        &self.processor.info().processor_type
    }

    async fn bind(&mut self) -> Result<Option<Dataset>, WorkerError> {
        match self.env.datasets.get(&self.job.remote_id).await {
            Ok(dataset) => Ok(Some(dataset)),
            Err(DatasetError::NotFound(_)) => {
                info!(
                    job_id = self.job.id,
                    remote_id = %self.job.remote_id,
                    "Dataset was deleted while queued, dropping job"
                );
                self.env.queue.finish(&mut self.job).await?;
                Ok(None)
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn resolve_source(&mut self, dataset: &mut Dataset) -> Result<Option<Source>, WorkerError> {
        let mut candidate = match dataset.get_parent().await {
            Ok(None) => {
                return Ok(Some(Source {
                    dataset: None,
                    in_preset: false,
                }))
            },
            Ok(Some(parent)) => parent,
            Err(DatasetError::NotFound(parent_key)) => {
                warn!(
                    key = %dataset.key(),
                    parent_key = %parent_key,
                    "Source dataset is missing, cannot process"
                );
                dataset.update_status(STATUS_PARENT_MISSING, true).await?;
                self.env.queue.finish(&mut self.job).await?;
                return Ok(None);
            },
            Err(e) => return Err(e.into()),
        };

        let mut in_preset = false;
        let mut visited = vec![dataset.key().to_string()];

        while self.env.registry.is_preset(candidate.dataset_type()) && !candidate.is_finished() {
            in_preset = true;
            visited.push(candidate.key().to_string());

            let above = match candidate.get_parent().await {
                Ok(Some(above)) if !visited.iter().any(|k| k == above.key()) => Some(above),
                Ok(_) | Err(DatasetError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };

            match above {
                Some(above) => candidate = above,
                None => {
                    self.handle_orphaned_preset(dataset, candidate.key()).await?;
                    return Ok(None);
                },
            }
        }

        Ok(Some(Source {
            dataset: Some(candidate),
            in_preset,
        }))
    }

    async fn handle_orphaned_preset(
        &mut self,
        dataset: &mut Dataset,
        preset_key: &str,
    ) -> Result<(), WorkerError> {
        match self.env.config.orphaned_preset_policy {
            OrphanedPresetPolicy::Finish => {
                warn!(
                    key = %dataset.key(),
                    preset_key = %preset_key,
                    "Preset chain has no source dataset, dropping job"
                );
                self.env.queue.finish(&mut self.job).await?;
            },
            OrphanedPresetPolicy::Escalate => {
                error!(
                    job_id = self.job.id,
                    key = %dataset.key(),
                    preset_key = %preset_key,
                    "Preset chain has no source dataset, operator attention required"
                );
                dataset.update_status(STATUS_ORPHANED_PRESET, true).await?;
                self.env
                    .queue
                    .add_status(&mut self.job, STATUS_ORPHANED_PRESET)
                    .await?;
            },
        }
        Ok(())
    }

    async fn prepare(
        &self,
        dataset: &mut Dataset,
        source: Option<&Dataset>,
    ) -> Result<Map<String, Value>, WorkerError> {
        dataset.clear_log().await?;
        dataset
            .log(&format!(
                "Processing '{}' started for dataset {}",
                self.processor_type(),
                dataset.key()
            ))
            .await?;
        dataset.update_status(STATUS_PROCESSING, false).await?;
        dataset.update_version(&self.env.config.software_version).await?;

        let schema = self.processor.options(source);
        let parameters = merge_defaults(&schema, dataset.parameters());

        let sensitive: Vec<String> = sensitive_options(&schema).map(str::to_string).collect();
        for name in sensitive {
            if dataset.delete_parameter(&name).await?.is_some() {
                debug!(key = %dataset.key(), option = %name, "Removed sensitive parameter");
            }
        }

        Ok(parameters)
    }

    async fn execute(
        &mut self,
        dataset: Dataset,
        source: Option<Dataset>,
        parameters: Map<String, Value>,
    ) -> Result<(), WorkerError> {
        let mut ctx = ProcessContext {
            job: self.job.clone(),
            dataset,
            source,
            parameters,
            interrupt: self.interrupt.clone(),
            queue: self.env.queue.clone(),
            datasets: self.env.datasets.clone(),
            registry: self.env.registry.clone(),
        };

        let result = self.processor.process(&mut ctx).await;
        let ProcessContext {
            dataset: mut finished,
            source,
            ..
        } = ctx;

        match result {
            Ok(()) => {
                self.after_process(&mut finished, source.as_ref()).await?;
                self.dataset = Some(finished);
                Ok(())
            },
            Err(ProcessorError::Interrupted) => {
                let level = self.interrupt.requested().unwrap_or(InterruptLevel::Retry);
                info!(
                    job_id = self.job.id,
                    key = %finished.key(),
                    level = %level,
                    "Processor interrupted"
                );
                self.dataset = Some(finished);
                self.abort_job(level).await
            },
            Err(ProcessorError::Failed { error, trail }) => {
                self.dataset = Some(finished);
                self.remove_partial_output().await;

                let failure = ProcessorFailure::new(
                    self.processor_type(),
                    self.job.remote_id.clone(),
                    self.dataset
                        .as_ref()
                        .and_then(|d| d.key_parent().map(str::to_string)),
                    error,
                    trail,
                );
                // the failure itself is what gets reported, whatever happens here
                if let Some(dataset) = self.dataset.as_mut() {
                    if let Err(e) = dataset.update_status(STATUS_CRASHED, true).await {
                        warn!(job_id = self.job.id, error = %e, "Could not mark dataset as crashed");
                    }
                    if let Err(e) = dataset.log(&failure.to_string()).await {
                        warn!(job_id = self.job.id, error = %e, "Could not write failure to dataset log");
                    }
                }
                Err(failure.into())
            },
        }
    }

    /// Finalize a successful run
    async fn after_process(
        &mut self,
        dataset: &mut Dataset,
        source: Option<&Dataset>,
    ) -> Result<(), WorkerError> {
        if dataset.num_rows() > 0 {
            dataset.update_status(STATUS_COMPLETED, false).await?;
        } else {
            dataset.update_status(STATUS_NO_DATA, false).await?;
        }

        if !dataset.is_finished() {
            let num_rows = dataset.num_rows();
            dataset.finish(num_rows).await?;
        }

        dataset.remove_staging_areas().await?;

        let available = source
            .unwrap_or(&*dataset)
            .get_available_processors(&self.env.registry)
            .await?;
        let created = chain::queue_follow_ups(
            dataset,
            &available,
            &self.env.registry,
            &self.env.datasets,
            &self.env.queue,
        )
        .await?;
        if !created.is_empty() {
            info!(key = %dataset.key(), follow_ups = created.len(), "Queued follow-up processors");
        }

        self.copy_to(dataset).await;
        self.attach_to(dataset).await?;

        dataset
            .log(&format!("Done, {} rows", dataset.num_rows()))
            .await?;
        self.env.queue.finish(&mut self.job).await?;
        Ok(())
    }

    /// Copy the result file to `copy_to`, or leave an empty file there
    async fn copy_to(&self, dataset: &Dataset) {
        let Some(target) = dataset.get_parameter("copy_to").and_then(Value::as_str) else {
            return;
        };
        let target = PathBuf::from(target);

        let result = async {
            if let Some(dir) = target.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir).await?;
            }
            let results = dataset.results_path();
            if tokio::fs::metadata(&results).await.is_ok_and(|m| m.is_file()) {
                tokio::fs::copy(&results, &target).await.map(|_| ())
            } else {
                tokio::fs::File::create(&target).await.map(|_| ())
            }
        }
        .await;

        if let Err(e) = result {
            warn!(key = %dataset.key(), target = %target.display(), error = %e, "Could not copy result file");
        }
    }

    /// Hand the result to the dataset named in `attach_to`
    async fn attach_to(&self, dataset: &Dataset) -> Result<(), WorkerError> {
        let Some(target_key) = dataset.get_parameter("attach_to").and_then(Value::as_str) else {
            return Ok(());
        };

        let mut target = match self.env.datasets.get(target_key).await {
            Ok(target) => target,
            Err(DatasetError::NotFound(_)) => {
                warn!(key = %dataset.key(), attach_to = %target_key, "Dataset to attach to no longer exists");
                return Ok(());
            },
            Err(e) => return Err(e.into()),
        };

        let results = dataset.results_path();
        if !dataset.result_file().is_empty() && tokio::fs::metadata(&results).await.is_ok() {
            if target.result_file().is_empty() {
                let extension = results
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if let Err(e) = target.reserve_result_file(&extension).await {
                    warn!(attach_to = %target_key, error = %e, "Could not reserve result file to attach to");
                    return Ok(());
                }
            }
            tokio::fs::copy(&results, target.results_path())
                .await
                .map_err(DatasetError::from)?;
        }

        match target.finish(dataset.num_rows()).await {
            Ok(()) | Err(DatasetError::AlreadyFinished(_)) => {},
            Err(e) => return Err(e.into()),
        }
        target.update_status(dataset.status(), false).await?;

        debug!(key = %dataset.key(), attach_to = %target_key, "Result attached");
        Ok(())
    }

    async fn remove_partial_output(&self) {
        let Some(dataset) = self.dataset.as_ref() else {
            return;
        };

        if let Err(e) = dataset.remove_result_file().await {
            warn!(key = %dataset.key(), error = %e, "Could not remove partial result file");
        }
        if let Err(e) = dataset.remove_staging_areas().await {
            warn!(key = %dataset.key(), error = %e, "Could not remove staging areas");
        }
    }

    /// Clean up and either requeue or drop the job
    async fn abort_job(&mut self, level: InterruptLevel) -> Result<(), WorkerError> {
        self.remove_partial_output().await;

        match level {
            InterruptLevel::Retry => {
                if let Some(dataset) = self.dataset.as_mut() {
                    dataset.update_status(STATUS_RETRY, false).await?;
                }
                self.env
                    .queue
                    .release(&mut self.job, self.env.config.interrupt_retry_secs, 0)
                    .await?;
            },
            InterruptLevel::Cancel => {
                if let Some(dataset) = self.dataset.as_mut() {
                    dataset.update_status(STATUS_CANCELLED, true).await?;
                }
                self.env.queue.finish(&mut self.job).await?;
            },
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for ProcessorRunner {
    fn job(&self) -> &Job {
        &self.job
    }

    async fn work(&mut self) -> Result<(), WorkerError> {
        let Some(mut dataset) = self.bind().await? else {
            return Ok(());
        };

        let Some(Source {
            dataset: source,
            in_preset,
        }) = self.resolve_source(&mut dataset).await?
        else {
            return Ok(());
        };

        if let Some(source) = source.as_ref() {
            if !in_preset && !source.is_finished() {
                debug!(
                    job_id = self.job.id,
                    key = %dataset.key(),
                    parent_key = %source.key(),
                    "Source dataset not finished yet, retrying later"
                );
                self.env
                    .queue
                    .release(&mut self.job, self.env.config.parent_wait_secs, 0)
                    .await?;
                return Ok(());
            }
        }

        if dataset.is_finished() {
            warn!(
                job_id = self.job.id,
                key = %dataset.key(),
                "Dataset is already finished, dropping duplicate job"
            );
            self.env.queue.finish(&mut self.job).await?;
            return Ok(());
        }

        let parameters = self.prepare(&mut dataset, source.as_ref()).await?;

        if let Some(level) = self.interrupt.requested() {
            self.dataset = Some(dataset);
            return self.abort_job(level).await;
        }

        if self.processor.info().is_preset {
            let steps = self.processor.pipeline(&dataset);
            preset::launch_pipeline(
                &mut dataset,
                steps,
                &self.env.registry,
                &self.env.datasets,
                &self.env.queue,
            )
            .await?;
            self.dataset = Some(dataset);
            self.env.queue.finish(&mut self.job).await?;
            return Ok(());
        }

        self.execute(dataset, source, parameters).await
    }

    async fn abort(&mut self) -> Result<(), WorkerError> {
        self.remove_partial_output().await;
        Ok(())
    }
}
