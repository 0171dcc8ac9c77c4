//! Processors
//!
//! A processor turns a source dataset (or, for searches, nothing) into a new
//! dataset's result file. Concrete processors implement [`Processor`] and are
//! registered in a [`ProcessorRegistry`]; [`ProcessorRunner`] drives one
//! processor through a job's lifecycle.

pub mod chain;
pub mod preset;
pub mod registry;
pub mod runner;
pub mod trace;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::dataset::{Dataset, DatasetError, Datasets};
use crate::queue::{Job, JobQueue, QueueError};
use crate::worker::interrupt::InterruptHandle;

pub use chain::ChainStep;
pub use registry::ProcessorRegistry;
pub use runner::{ProcessorRunner, RunnerEnv};
pub use trace::ProcessorFailure;

use trace::capture_trail;

/// Error returned from [`Processor::process`]
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// An interrupt was requested and the processor stopped at a safe point
    #[error("Processor interrupted")]
    Interrupted,

    /// `trail` is captured where the error entered the processor
    #[error("{error}")]
    Failed { error: anyhow::Error, trail: String },
}

impl From<anyhow::Error> for ProcessorError {
    fn from(error: anyhow::Error) -> Self {
        Self::Failed {
            error,
            trail: capture_trail(),
        }
    }
}

impl From<DatasetError> for ProcessorError {
    fn from(err: DatasetError) -> Self {
        Self::Failed {
            error: err.into(),
            trail: capture_trail(),
        }
    }
}

impl From<QueueError> for ProcessorError {
    fn from(err: QueueError) -> Self {
        Self::Failed {
            error: err.into(),
            trail: capture_trail(),
        }
    }
}

impl From<std::io::Error> for ProcessorError {
    fn from(err: std::io::Error) -> Self {
        Self::Failed {
            error: err.into(),
            trail: capture_trail(),
        }
    }
}

/// Input types a processor accepts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accepts {
    /// Only runs as a top-level dataset, never as a follow-up
    TopLevel,
    /// Dataset types, exact or with a leading `*` wildcard (`*-search`)
    Types(Vec<String>),
}

impl Accepts {
    pub fn types<I, S>(types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Types(types.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, dataset_type: &str) -> bool {
        match self {
            Self::TopLevel => false,
            Self::Types(patterns) => patterns.iter().any(|pattern| {
                match pattern.strip_prefix('*') {
                    Some(suffix) => dataset_type.ends_with(suffix),
                    None => pattern == dataset_type,
                }
            }),
        }
    }
}

/// Static metadata for a processor type
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorInfo {
    pub processor_type: String,
    pub title: String,
    pub description: String,
    pub category: String,
    /// Result file extension
    pub extension: String,
    pub accepts: Accepts,
    /// Concurrency ceiling enforced by the worker manager
    pub max_workers: usize,
    /// Presets have no data of their own and only launch a pipeline
    pub is_preset: bool,
}

impl ProcessorInfo {
    pub fn new(processor_type: impl Into<String>) -> Self {
        let processor_type = processor_type.into();
        Self {
            title: processor_type.clone(),
            processor_type,
            description: String::new(),
            category: "Miscellaneous".to_string(),
            extension: "csv".to_string(),
            accepts: Accepts::TopLevel,
            max_workers: 1,
            is_preset: false,
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn accepts(mut self, accepts: Accepts) -> Self {
        self.accepts = accepts;
        self
    }

    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    pub fn preset(mut self) -> Self {
        self.is_preset = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionKind {
    Text,
    Toggle,
    Number,
    Choice(Vec<String>),
    Hidden,
}

/// One user-configurable processor option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionSpec {
    pub kind: OptionKind,
    pub help: String,
    pub default: Option<Value>,
    /// Removed from stored parameters once a run has started
    pub sensitive: bool,
}

impl OptionSpec {
    pub fn new(kind: OptionKind, help: impl Into<String>) -> Self {
        Self {
            kind,
            help: help.into(),
            default: None,
            sensitive: false,
        }
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }
}

/// Option name to spec
pub type OptionSchema = BTreeMap<String, OptionSpec>;

/// Stored parameters with declared defaults filling the gaps
pub fn merge_defaults(schema: &OptionSchema, stored: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = Map::new();
    for (name, spec) in schema {
        if let Some(default) = &spec.default {
            merged.insert(name.clone(), default.clone());
        }
    }
    for (name, value) in stored {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

/// Names of options flagged sensitive
pub fn sensitive_options(schema: &OptionSchema) -> impl Iterator<Item = &str> {
    schema
        .iter()
        .filter(|(_, spec)| spec.sensitive)
        .map(|(name, _)| name.as_str())
}

/// Everything a running processor gets to work with
pub struct ProcessContext {
    pub job: Job,
    pub dataset: Dataset,
    /// Effective input; presets in between are skipped
    pub source: Option<Dataset>,
    /// Stored parameters merged with option defaults
    pub parameters: Map<String, Value>,
    pub interrupt: InterruptHandle,
    pub queue: JobQueue,
    pub datasets: Datasets,
    pub registry: Arc<ProcessorRegistry>,
}

impl ProcessContext {
    /// Stop here if an interrupt was requested
    pub fn check_interrupt(&self) -> Result<(), ProcessorError> {
        if self.interrupt.is_requested() {
            return Err(ProcessorError::Interrupted);
        }
        Ok(())
    }

    pub fn parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn results_path(&self) -> PathBuf {
        self.dataset.results_path()
    }

    /// Result file of the effective source dataset
    pub fn source_path(&self) -> Option<PathBuf> {
        self.source.as_ref().map(Dataset::results_path)
    }

    pub async fn staging_area(&self) -> Result<PathBuf, ProcessorError> {
        Ok(self.dataset.staging_area().await?)
    }

    pub async fn update_status(&mut self, status: impl Into<String>) -> Result<(), ProcessorError> {
        self.dataset.update_status(status, false).await?;
        Ok(())
    }

    /// Mark the dataset finished with `num_rows` rows
    pub async fn finish(&mut self, num_rows: i64) -> Result<(), ProcessorError> {
        self.dataset.finish(num_rows).await?;
        Ok(())
    }
}

/// A processor type
#[async_trait]
pub trait Processor: Send + Sync {
    fn info(&self) -> &ProcessorInfo;

    /// User-configurable options, possibly depending on the parent dataset
    fn options(&self, _parent: Option<&Dataset>) -> OptionSchema {
        OptionSchema::new()
    }

    /// Whether this processor can run on `dataset`
    fn is_compatible_with(&self, dataset: &Dataset) -> bool {
        self.info().accepts.matches(dataset.dataset_type())
    }

    /// Steps a preset launches, first step first
    fn pipeline(&self, _dataset: &Dataset) -> Vec<ChainStep> {
        Vec::new()
    }

    /// Produce the dataset's result file
    ///
    /// Implementations write to [`ProcessContext::results_path`], call
    /// [`ProcessContext::finish`] with the row count, and call
    /// [`ProcessContext::check_interrupt`] regularly in long loops.
    async fn process(&self, ctx: &mut ProcessContext) -> Result<(), ProcessorError>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_patterns() {
        let accepts = Accepts::types(["*-search", "csv"]);
        assert!(accepts.matches("forum-search"));
        assert!(accepts.matches("csv"));
        assert!(!accepts.matches("count-words"));
        assert!(!Accepts::TopLevel.matches("forum-search"));
        assert!(Accepts::types(["*"]).matches("anything"));
    }

    #[test]
    fn test_merge_defaults_prefers_stored_values() {
        let mut schema = OptionSchema::new();
        schema.insert(
            "amount".to_string(),
            OptionSpec::new(OptionKind::Number, "Rows").default_value(json!(10)),
        );
        schema.insert(
            "lowercase".to_string(),
            OptionSpec::new(OptionKind::Toggle, "Lowercase").default_value(json!(true)),
        );
        schema.insert(
            "api_key".to_string(),
            OptionSpec::new(OptionKind::Text, "Key").sensitive(),
        );

        let stored = json!({"amount": 25, "extra": "x"}).as_object().unwrap().clone();
        let merged = merge_defaults(&schema, &stored);

        assert_eq!(merged["amount"], json!(25));
        assert_eq!(merged["lowercase"], json!(true));
        assert_eq!(merged["extra"], json!("x"));
        assert!(!merged.contains_key("api_key"));
        assert_eq!(sensitive_options(&schema).collect::<Vec<_>>(), vec!["api_key"]);
    }

    #[test]
    fn test_info_builder() {
        let info = ProcessorInfo::new("count-words")
            .title("Count words")
            .accepts(Accepts::types(["*-search"]))
            .max_workers(0)
            .extension("json");

        assert_eq!(info.title, "Count words");
        assert_eq!(info.max_workers, 1);
        assert_eq!(info.extension, "json");
        assert!(!info.is_preset);
        assert!(ProcessorInfo::new("p").preset().is_preset);
    }
}
