//! Follow-up processing declared in a dataset's `next` parameter
//!
//! `next` holds a list of `{"type": ..., "parameters": {...}}` entries. When
//! a dataset finishes with rows, every entry the parent's available
//! processors allow becomes a child dataset with its own queued job.
//! An empty dataset runs none of its follow-ups, and an unavailable entry is
//! skipped; datasets those follow-ups would have attached their result to
//! are finished empty instead.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use super::runner::STATUS_NO_DATA;
use super::{ProcessorInfo, ProcessorRegistry};
use crate::dataset::{Dataset, DatasetError, DatasetResult, Datasets, NewDataset};
use crate::queue::{JobQueue, NewJob, QueueError};

/// Status of an attach target whose pipeline step could not run
pub const STATUS_STEP_UNAVAILABLE: &str =
    "Finished without data, a follow-up step is not available for this dataset.";

/// One follow-up processor with its parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    #[serde(rename = "type")]
    pub processor_type: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl ChainStep {
    pub fn new(processor_type: impl Into<String>) -> Self {
        Self {
            processor_type: processor_type.into(),
            parameters: Map::new(),
        }
    }

    pub fn parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn to_value(&self) -> Value {
        let mut entry = Map::new();
        entry.insert("type".to_string(), Value::String(self.processor_type.clone()));
        entry.insert("parameters".to_string(), Value::Object(self.parameters.clone()));
        Value::Object(entry)
    }
}

/// Parse the `next` parameter, skipping malformed entries
pub fn next_steps(parameters: &Map<String, Value>) -> Vec<ChainStep> {
    let Some(Value::Array(entries)) = parameters.get("next") else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match serde_json::from_value::<ChainStep>(entry.clone()) {
            Ok(step) => Some(step),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed follow-up entry");
                None
            },
        })
        .collect()
}

/// Fold a pipeline into nested `next` entries
///
/// Step `i + 1` becomes the only `next` entry of step `i`; the returned
/// step is the first one. `None` for an empty pipeline.
pub fn nest_pipeline(mut steps: Vec<ChainStep>) -> Option<ChainStep> {
    let mut nested = steps.pop()?;
    while let Some(mut previous) = steps.pop() {
        previous
            .parameters
            .insert("next".to_string(), Value::Array(vec![nested.to_value()]));
        nested = previous;
    }
    Some(nested)
}

/// `attach_to` keys anywhere in `steps` or their nested `next` entries
pub fn attach_targets(steps: &[ChainStep]) -> Vec<String> {
    let mut targets = Vec::new();
    for step in steps {
        if let Some(key) = step.parameters.get("attach_to").and_then(Value::as_str) {
            if !targets.iter().any(|t| t == key) {
                targets.push(key.to_string());
            }
        }
        for key in attach_targets(&next_steps(&step.parameters)) {
            if !targets.contains(&key) {
                targets.push(key);
            }
        }
    }
    targets
}

/// Finish every dataset that was waiting on `steps` with zero rows
async fn settle_attach_targets(
    dataset: &Dataset,
    steps: &[ChainStep],
    datasets: &Datasets,
    status: &str,
) -> DatasetResult<()> {
    for key in attach_targets(steps) {
        let mut target = match datasets.get(&key).await {
            Ok(target) => target,
            Err(DatasetError::NotFound(_)) => {
                warn!(key = %dataset.key(), attach_to = %key, "Dataset to attach to no longer exists");
                continue;
            },
            Err(e) => return Err(e),
        };
        if target.is_finished() {
            continue;
        }

        target.finish(0).await?;
        target.update_status(status, false).await?;
        info!(key = %dataset.key(), attach_to = %key, "Finished waiting dataset without data");
    }
    Ok(())
}

/// Create a child dataset of `parent` for `step` and queue its job
pub async fn launch_step(
    parent: &Dataset,
    step: &ChainStep,
    info: &ProcessorInfo,
    datasets: &Datasets,
    queue: &JobQueue,
) -> DatasetResult<Dataset> {
    let child = datasets
        .create(
            NewDataset::new(&step.processor_type)
                .parameters(step.parameters.clone())
                .parent(parent.key())
                .extension(&info.extension)
                .owner(parent.owner())
                .private(parent.is_private()),
        )
        .await?;

    match queue
        .add(NewJob::new(&step.processor_type, child.key()))
        .await
    {
        Ok(job) => {
            debug!(job_id = job.id, key = %child.key(), "Follow-up job queued");
        },
        Err(QueueError::JobAlreadyExists { .. }) => {
            debug!(key = %child.key(), "Follow-up job was already queued");
        },
        Err(QueueError::Db(e)) => return Err(e.into()),
        Err(e) => {
            warn!(key = %child.key(), error = %e, "Could not queue follow-up job");
        },
    }

    Ok(child)
}

/// Queue the follow-ups of a just-finished dataset
///
/// `available` is the set of processors the dataset's parent (or the
/// dataset itself, when top-level) may feed into. Returns the datasets that
/// were created.
pub async fn queue_follow_ups(
    dataset: &Dataset,
    available: &BTreeMap<String, ProcessorInfo>,
    registry: &ProcessorRegistry,
    datasets: &Datasets,
    queue: &JobQueue,
) -> DatasetResult<Vec<Dataset>> {
    let steps = next_steps(dataset.parameters());
    if steps.is_empty() {
        return Ok(Vec::new());
    }

    if dataset.num_rows() <= 0 {
        info!(key = %dataset.key(), skipped = steps.len(), "Not running follow-up processors on empty dataset");
        dataset
            .log("No results; follow-up processors were not run.")
            .await?;
        settle_attach_targets(dataset, &steps, datasets, STATUS_NO_DATA).await?;
        return Ok(Vec::new());
    }

    let mut created = Vec::new();
    for step in &steps {
        let (Some(info), true) = (
            registry.info(&step.processor_type),
            available.contains_key(&step.processor_type),
        ) else {
            warn!(
                key = %dataset.key(),
                processor_type = %step.processor_type,
                "Follow-up processor is not available for this dataset, skipping"
            );
            settle_attach_targets(
                dataset,
                std::slice::from_ref(step),
                datasets,
                STATUS_STEP_UNAVAILABLE,
            )
            .await?;
            continue;
        };

        created.push(launch_step(dataset, step, info, datasets, queue).await?);
    }

    Ok(created)
}
