//! Presets
//!
//! A preset is a processor with no data of its own. Running it launches a
//! pipeline of ordinary processors as a nested `next` chain under the preset
//! dataset; the last step carries `attach_to` so its result is copied onto
//! the preset, which finishes the preset. Until then the preset stays
//! unfinished and its descendants look past it to the real source.

use serde_json::Value;
use tracing::{info, warn};

use super::chain::{launch_step, nest_pipeline};
use super::{ChainStep, ProcessorRegistry};
use crate::dataset::{Dataset, DatasetResult, Datasets};
use crate::queue::JobQueue;

/// Status shown on a preset while its pipeline runs
pub const STATUS_AWAITING_PIPELINE: &str = "Awaiting completion of underlying analyses...";

/// Start the pipeline of a preset dataset
///
/// Returns the first pipeline dataset, or `None` if there was nothing
/// to start.
pub async fn launch_pipeline(
    preset: &mut Dataset,
    mut steps: Vec<ChainStep>,
    registry: &ProcessorRegistry,
    datasets: &Datasets,
    queue: &JobQueue,
) -> DatasetResult<Option<Dataset>> {
    if let Some(unknown) = steps
        .iter()
        .find(|step| registry.info(&step.processor_type).is_none())
    {
        warn!(
            key = %preset.key(),
            processor_type = %unknown.processor_type,
            "Preset pipeline names an unknown processor"
        );
        preset
            .update_status(
                format!("Preset step '{}' is not available", unknown.processor_type),
                true,
            )
            .await?;
        return Ok(None);
    }

    if let Some(last) = steps.last_mut() {
        last.parameters
            .insert("attach_to".to_string(), Value::String(preset.key().to_string()));
    }

    let Some(first) = nest_pipeline(steps) else {
        warn!(key = %preset.key(), "Preset has an empty pipeline");
        return Ok(None);
    };

    let Some(info) = registry.info(&first.processor_type) else {
        return Ok(None);
    };

    let child = launch_step(preset, &first, info, datasets, queue).await?;
    preset.update_status(STATUS_AWAITING_PIPELINE, false).await?;

    info!(
        key = %preset.key(),
        first_step = %child.key(),
        "Preset pipeline started"
    );
    Ok(Some(child))
}
