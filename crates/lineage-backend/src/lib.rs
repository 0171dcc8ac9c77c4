//! Lineage Backend Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Job queue, dataset lifecycle and processor orchestration for the Lineage
//! research-data pipeline.
//!
//! # Overview
//!
//! - **Store**: `jobs` and `datasets` row collections, in PostgreSQL or memory
//! - **Queue**: add / claim / release / finish jobs; claims are compare-and-set
//! - **Datasets**: content-addressed keys, result files, genealogy,
//!   finish/unfinish, cascade delete
//! - **Processors**: the [`processor::Processor`] trait, a registry and the
//!   runner that takes a job from claim to finalize
//! - **Workers**: crash and interrupt containment around a single job
//! - **Manager**: the dispatch loop that starts runners within per-type limits
//!
//! # Data flow
//!
//! A client creates a dataset and queues a job whose `remote_id` is the
//! dataset key. The manager claims the job and starts a runner. The runner
//! waits for the parent dataset to finish (by releasing the job with a
//! delay), runs the processor, finishes the dataset and queues follow-up
//! datasets listed in the `next` parameter.
//!
//! # Example
//!
//! ```no_run
//! use lineage_backend::dataset::{Datasets, NewDataset};
//! use lineage_backend::queue::{JobQueue, NewJob};
//! use lineage_backend::store::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! let datasets = Datasets::new(store.clone(), "./data");
//! let queue = JobQueue::new(store);
//!
//! let dataset = datasets
//!     .create(NewDataset::new("count-rows").parent("0123456789abcdef"))
//!     .await?;
//! queue.add(NewJob::new("count-rows", dataset.key())).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dataset;
pub mod db;
pub mod error;
pub mod manager;
pub mod processor;
pub mod processors;
pub mod queue;
pub mod store;
pub mod worker;

pub use error::{BackendError, BackendResult};
