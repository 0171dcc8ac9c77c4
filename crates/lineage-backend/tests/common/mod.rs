//! Shared fixtures for backend integration tests
//!
//! [`TestEnv`] wires an in-memory store, a temporary data directory and a
//! registry of small test processors:
//!
//! | type            | accepts           | behaviour                              |
//! |-----------------|-------------------|----------------------------------------|
//! | `search`        | top-level only    | writes `rows` rows                     |
//! | `count-words`   | `search`          | counts source rows, no options         |
//! | `top-words`     | anything          | writes one row                         |
//! | `with-secret`   | anything          | has a sensitive option, dumps params   |
//! | `explode`       | anything          | writes a partial file, then fails      |
//! | `panic`         | anything          | panics                                 |
//! | `vanish`        | anything          | deletes its own dataset, then fails    |
//! | `interruptible` | anything          | waits for an interrupt, two at a time  |
//! | `preset-words`  | `search`          | preset: count-words, then top-words    |

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

pub mod postgres;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tempfile::TempDir;

use lineage_backend::config::WorkerConfig;
use lineage_backend::dataset::{Dataset, Datasets, NewDataset};
use lineage_backend::processor::{
    Accepts, ChainStep, OptionKind, OptionSchema, OptionSpec, ProcessContext, Processor,
    ProcessorError, ProcessorInfo, ProcessorRegistry, ProcessorRunner, RunnerEnv,
};
use lineage_backend::queue::{Job, JobQueue, NewJob};
use lineage_backend::store::MemoryStore;
use lineage_backend::worker::{run_worker, InterruptHandle, WorkerContext, WorkerOutcome};

// ============================================================================
// Test processors
// ============================================================================

pub struct Search(ProcessorInfo);

#[async_trait]
impl Processor for Search {
    fn info(&self) -> &ProcessorInfo {
        &self.0
    }

    async fn process(&self, ctx: &mut ProcessContext) -> Result<(), ProcessorError> {
        let rows = ctx.parameter("rows").and_then(Value::as_i64).unwrap_or(0);
        if rows > 0 {
            let mut body = String::from("id,body\n");
            for i in 0..rows {
                body.push_str(&format!("{},post {}\n", i, i));
            }
            tokio::fs::write(ctx.results_path(), body).await?;
        }
        ctx.finish(rows).await
    }
}

pub struct CountWords(ProcessorInfo);

#[async_trait]
impl Processor for CountWords {
    fn info(&self) -> &ProcessorInfo {
        &self.0
    }

    async fn process(&self, ctx: &mut ProcessContext) -> Result<(), ProcessorError> {
        let source = ctx.source_path().context("count-words needs a source")?;
        let content = tokio::fs::read_to_string(&source).await?;
        let rows = content.lines().skip(1).count() as i64;

        tokio::fs::write(ctx.results_path(), format!("word,count\npost,{}\n", rows)).await?;
        ctx.finish(rows).await
    }
}

pub struct TopWords(ProcessorInfo);

#[async_trait]
impl Processor for TopWords {
    fn info(&self) -> &ProcessorInfo {
        &self.0
    }

    async fn process(&self, ctx: &mut ProcessContext) -> Result<(), ProcessorError> {
        tokio::fs::write(ctx.results_path(), "word\npost\n").await?;
        ctx.finish(1).await
    }
}

pub struct WithSecret(ProcessorInfo);

#[async_trait]
impl Processor for WithSecret {
    fn info(&self) -> &ProcessorInfo {
        &self.0
    }

    fn options(&self, _parent: Option<&Dataset>) -> OptionSchema {
        let mut options = OptionSchema::new();
        options.insert(
            "api_key".to_string(),
            OptionSpec::new(OptionKind::Text, "API key").sensitive(),
        );
        options.insert(
            "limit".to_string(),
            OptionSpec::new(OptionKind::Number, "Limit").default_value(json!(5)),
        );
        options
    }

    async fn process(&self, ctx: &mut ProcessContext) -> Result<(), ProcessorError> {
        let dump = serde_json::to_string(&ctx.parameters).context("encoding parameters")?;
        tokio::fs::write(ctx.results_path(), dump).await?;
        ctx.finish(1).await
    }
}

pub struct Explode(ProcessorInfo);

#[async_trait]
impl Processor for Explode {
    fn info(&self) -> &ProcessorInfo {
        &self.0
    }

    async fn process(&self, ctx: &mut ProcessContext) -> Result<(), ProcessorError> {
        tokio::fs::write(ctx.results_path(), "partial").await?;
        ctx.staging_area().await?;
        Err(anyhow::anyhow!("source file is corrupt").into())
    }
}

pub struct Vanish(ProcessorInfo);

#[async_trait]
impl Processor for Vanish {
    fn info(&self) -> &ProcessorInfo {
        &self.0
    }

    async fn process(&self, ctx: &mut ProcessContext) -> Result<(), ProcessorError> {
        let own = ctx.datasets.get(ctx.dataset.key()).await.context("loading own dataset")?;
        own.delete().await.context("deleting own dataset")?;
        tokio::fs::write(ctx.results_path(), "partial").await?;
        ctx.staging_area().await?;
        Err(anyhow::anyhow!("dataset vanished mid-run").into())
    }
}

pub struct Panics(ProcessorInfo);

#[async_trait]
impl Processor for Panics {
    fn info(&self) -> &ProcessorInfo {
        &self.0
    }

    async fn process(&self, _ctx: &mut ProcessContext) -> Result<(), ProcessorError> {
        panic!("index out of range in test processor");
    }
}

pub struct Interruptible(ProcessorInfo);

#[async_trait]
impl Processor for Interruptible {
    fn info(&self) -> &ProcessorInfo {
        &self.0
    }

    async fn process(&self, ctx: &mut ProcessContext) -> Result<(), ProcessorError> {
        ctx.interrupt.wait().await;
        ctx.check_interrupt()?;
        ctx.finish(0).await
    }
}

pub struct WordsPreset(ProcessorInfo);

#[async_trait]
impl Processor for WordsPreset {
    fn info(&self) -> &ProcessorInfo {
        &self.0
    }

    fn pipeline(&self, _dataset: &Dataset) -> Vec<ChainStep> {
        vec![ChainStep::new("count-words"), ChainStep::new("top-words")]
    }

    async fn process(&self, _ctx: &mut ProcessContext) -> Result<(), ProcessorError> {
        Ok(())
    }
}

pub fn test_registry() -> ProcessorRegistry {
    let anything = || Accepts::types(["*"]);
    ProcessorRegistry::new()
        .with(Search(ProcessorInfo::new("search")))
        .with(CountWords(
            ProcessorInfo::new("count-words").accepts(Accepts::types(["search"])),
        ))
        .with(TopWords(ProcessorInfo::new("top-words").accepts(anything())))
        .with(WithSecret(
            ProcessorInfo::new("with-secret")
                .accepts(anything())
                .extension("json"),
        ))
        .with(Explode(ProcessorInfo::new("explode").accepts(anything())))
        .with(Panics(ProcessorInfo::new("panic").accepts(anything())))
        .with(Vanish(ProcessorInfo::new("vanish").accepts(anything())))
        .with(Interruptible(
            ProcessorInfo::new("interruptible")
                .accepts(anything())
                .max_workers(2),
        ))
        .with(WordsPreset(
            ProcessorInfo::new("preset-words")
                .accepts(Accepts::types(["search"]))
                .preset(),
        ))
}

// ============================================================================
// Environment
// ============================================================================

pub struct TestEnv {
    pub dir: TempDir,
    pub store: Arc<MemoryStore>,
    pub queue: JobQueue,
    pub datasets: Datasets,
    pub registry: Arc<ProcessorRegistry>,
    pub config: WorkerConfig,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_config(WorkerConfig::default())
    }

    pub fn with_config(config: WorkerConfig) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(MemoryStore::new());
        Self {
            queue: JobQueue::new(store.clone()),
            datasets: Datasets::new(store.clone(), dir.path().join("data")),
            registry: Arc::new(test_registry()),
            store,
            dir,
            config,
        }
    }

    pub fn runner_env(&self) -> RunnerEnv {
        RunnerEnv {
            queue: self.queue.clone(),
            datasets: self.datasets.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }

    /// Create a top-level search dataset that will produce `rows` rows
    pub async fn search(&self, query: &str, rows: i64) -> Dataset {
        self.create(
            NewDataset::new("search")
                .parameter("body_match", json!(query))
                .parameter("rows", json!(rows)),
        )
        .await
    }

    pub async fn create(&self, new: NewDataset) -> Dataset {
        self.datasets.create(new).await.unwrap()
    }

    /// Create a child of `parent` of the given processor type
    pub async fn child(&self, parent: &Dataset, processor_type: &str) -> Dataset {
        self.child_with(parent, processor_type, Map::new()).await
    }

    pub async fn child_with(
        &self,
        parent: &Dataset,
        processor_type: &str,
        parameters: Map<String, Value>,
    ) -> Dataset {
        self.create(
            NewDataset::new(processor_type)
                .parameters(parameters)
                .parent(parent.key()),
        )
        .await
    }

    /// Queue the job that produces `dataset`
    pub async fn queue_for(&self, dataset: &Dataset) -> Job {
        self.queue
            .add(NewJob::new(dataset.dataset_type(), dataset.key()))
            .await
            .unwrap()
    }

    /// Claim and run a job with a fresh interrupt handle
    pub async fn run(&self, job: Job) -> WorkerOutcome {
        self.run_with(job, InterruptHandle::new()).await
    }

    /// Claim and run a job with the given interrupt handle
    pub async fn run_with(&self, mut job: Job, interrupt: InterruptHandle) -> WorkerOutcome {
        self.queue.claim(&mut job).await.unwrap();
        let processor = self
            .registry
            .get(&job.jobtype)
            .cloned()
            .expect("registered processor");

        let runner = ProcessorRunner::new(job, processor, self.runner_env(), interrupt);
        run_worker(
            runner,
            WorkerContext {
                queue: self.queue.clone(),
                interrupt_retry_secs: self.config.interrupt_retry_secs,
            },
        )
        .await
    }

    /// Create, queue and run a dataset in one go
    pub async fn produce(&self, dataset: &Dataset) -> WorkerOutcome {
        let job = self.queue_for(dataset).await;
        self.run(job).await
    }

    /// Load the current state of a dataset
    pub async fn reload(&self, dataset: &Dataset) -> Dataset {
        self.datasets.get(dataset.key()).await.unwrap()
    }

    /// Jobs waiting for a dataset
    pub async fn jobs_for(&self, dataset: &Dataset) -> Vec<Job> {
        self.queue
            .all_jobs(None)
            .await
            .unwrap()
            .into_iter()
            .filter(|job| job.remote_id == dataset.key())
            .collect()
    }
}

/// Install a test subscriber so `tracing` output shows with `--nocapture`
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("lineage_backend=debug")
        .with_test_writer()
        .try_init();
}

/// Check if Docker is available
///
/// Returns true if the Docker daemon is running and accessible.
pub fn is_docker_available() -> bool {
    std::process::Command::new("docker")
        .arg("info")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Skip a test that needs a container when Docker is not available
#[macro_export]
macro_rules! skip_if_no_docker {
    () => {
        if !$crate::common::is_docker_available() {
            eprintln!("Skipping test: Docker is not available");
            return;
        }
    };
}
