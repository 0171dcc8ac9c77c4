//! Row counter
//!
//! Counts the data rows of a CSV source dataset and writes a one-row CSV
//! with the total.

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::processor::{
    Accepts, OptionKind, OptionSchema, OptionSpec, ProcessContext, Processor, ProcessorError,
    ProcessorInfo,
};
use crate::dataset::Dataset;

/// Lines read between interrupt checks
const CHECK_EVERY: u64 = 1000;

pub struct CountRows {
    info: ProcessorInfo,
}

impl CountRows {
    pub const TYPE: &'static str = "count-rows";

    pub fn new() -> Self {
        Self {
            info: ProcessorInfo::new(Self::TYPE)
                .title("Count rows")
                .description("Count the number of items in the dataset")
                .category("Metrics")
                .extension("csv")
                .accepts(Accepts::types(["*"]))
                .max_workers(2),
        }
    }
}

impl Default for CountRows {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Processor for CountRows {
    fn info(&self) -> &ProcessorInfo {
        &self.info
    }

    fn options(&self, _parent: Option<&Dataset>) -> OptionSchema {
        let mut options = OptionSchema::new();
        options.insert(
            "skip_empty".to_string(),
            OptionSpec::new(OptionKind::Toggle, "Ignore empty lines")
                .default_value(serde_json::Value::Bool(true)),
        );
        options
    }

    fn is_compatible_with(&self, dataset: &Dataset) -> bool {
        dataset.result_file().ends_with(".csv")
    }

    async fn process(&self, ctx: &mut ProcessContext) -> Result<(), ProcessorError> {
        let Some(source) = ctx.source_path() else {
            ctx.update_status("No source dataset to count").await?;
            ctx.finish(0).await?;
            return Ok(());
        };

        let skip_empty = ctx
            .parameter("skip_empty")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true);

        let file = tokio::fs::File::open(&source)
            .await
            .with_context(|| format!("opening {}", source.display()))?;
        let mut lines = BufReader::new(file).lines();

        let mut seen = 0u64;
        let mut rows = 0i64;
        let mut header = true;
        while let Some(line) = lines.next_line().await? {
            seen += 1;
            if seen % CHECK_EVERY == 0 {
                ctx.check_interrupt()?;
            }
            if header {
                header = false;
                continue;
            }
            if skip_empty && line.trim().is_empty() {
                continue;
            }
            rows += 1;
        }

        ctx.update_status(format!("Counted {} rows", rows)).await?;
        tokio::fs::write(ctx.results_path(), format!("rows\n{}\n", rows)).await?;
        ctx.finish(1).await?;
        Ok(())
    }
}
