//! Datasets
//!
//! A dataset is one unit of produced data: a search result or the output of
//! a processor run over another dataset. Datasets form a tree through
//! `key_parent`. Each dataset owns one result file in the data directory,
//! reserved when the dataset is created.
//!
//! [`Datasets`] creates and loads datasets; [`Dataset`] is the in-memory
//! handle a worker holds while it processes one.

pub mod files;
pub mod key;

use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::db::DbError;
use crate::processor::{ProcessorInfo, ProcessorRegistry};
use crate::queue::unix_now;
use crate::store::{DatasetRow, Store};

pub use key::{derive_label, is_random_sample, DEFAULT_LABEL};

/// Status shown for datasets waiting in the queue
pub const STATUS_QUEUED: &str = "Dataset is queued.";

/// Dataset errors
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset '{0}' not found")]
    NotFound(String),

    /// A finished dataset was finished again or had a file reserved
    #[error("Dataset '{0}' is already finished")]
    AlreadyFinished(String),

    #[error("Dataset '{0}' is not finished")]
    NotFinished(String),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] lineage_common::LineageError),
}

pub type DatasetResult<T> = Result<T, DatasetError>;

/// Request to create a dataset
#[derive(Debug, Clone)]
pub struct NewDataset {
    pub dataset_type: String,
    pub parameters: Map<String, Value>,
    pub parent: Option<String>,
    /// Overrides the label derived from the parameters
    pub label: Option<String>,
    pub extension: String,
    pub owner: String,
    pub is_private: bool,
}

impl NewDataset {
    pub fn new(dataset_type: impl Into<String>) -> Self {
        Self {
            dataset_type: dataset_type.into(),
            parameters: Map::new(),
            parent: None,
            label: None,
            extension: "csv".to_string(),
            owner: "anonymous".to_string(),
            is_private: true,
        }
    }

    pub fn parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn parent(mut self, key: impl Into<String>) -> Self {
        self.parent = Some(key.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn private(mut self, is_private: bool) -> Self {
        self.is_private = is_private;
        self
    }
}

/// Creates and loads datasets
#[derive(Clone)]
pub struct Datasets {
    store: Arc<dyn Store>,
    data_dir: PathBuf,
}

impl Datasets {
    pub fn new(store: Arc<dyn Store>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn wrap(&self, row: DatasetRow) -> Dataset {
        Dataset::from_row(row, self.store.clone(), self.data_dir.clone())
    }

    /// Create a dataset, or return the existing one with the same key
    pub async fn create(&self, mut new: NewDataset) -> DatasetResult<Dataset> {
        // keeps option-less siblings of different types apart
        new.parameters
            .entry("type")
            .or_insert_with(|| Value::String(new.dataset_type.clone()));

        let label = new
            .label
            .clone()
            .unwrap_or_else(|| derive_label(&new.parameters, DEFAULT_LABEL));
        let key = key::dataset_key(&new.parameters, &label, new.parent.as_deref())?;

        if let Some(existing) = self.store.fetch_dataset(&key).await? {
            debug!(key = %key, "Dataset with identical parameters already exists");
            return Ok(self.wrap(existing));
        }

        let row = DatasetRow {
            key: key.clone(),
            dataset_type: new.dataset_type,
            key_parent: new.parent,
            query: label,
            parameters: Value::Object(new.parameters),
            result_file: String::new(),
            status: STATUS_QUEUED.to_string(),
            is_finished: false,
            num_rows: 0,
            progress: 0.0,
            timestamp: unix_now(),
            software_version: String::new(),
            owner: new.owner,
            is_private: new.is_private,
        };

        match self.store.insert_dataset(&row).await {
            Ok(()) => {},
            // lost a race with an identical request
            Err(DbError::Duplicate(_)) => return self.get(&key).await,
            Err(e) => return Err(e.into()),
        }

        let mut dataset = self.wrap(row);
        dataset.reserve_result_file(&new.extension).await?;

        info!(key = %dataset.key(), dataset_type = %dataset.dataset_type(), "Dataset created");
        Ok(dataset)
    }

    /// Load a dataset by key
    pub async fn get(&self, key: &str) -> DatasetResult<Dataset> {
        self.store
            .fetch_dataset(key)
            .await?
            .map(|row| self.wrap(row))
            .ok_or_else(|| DatasetError::NotFound(key.to_string()))
    }

    /// Load the dataset whose parameters reference job `job_id`
    pub async fn get_by_job(&self, job_id: i64) -> DatasetResult<Dataset> {
        self.store
            .fetch_dataset_by_job(job_id)
            .await?
            .map(|row| self.wrap(row))
            .ok_or_else(|| DatasetError::NotFound(format!("job {}", job_id)))
    }
}

/// In-memory handle on one dataset
#[derive(Clone)]
pub struct Dataset {
    row: DatasetRow,
    parameters: Map<String, Value>,
    store: Arc<dyn Store>,
    data_dir: PathBuf,
    status_final: bool,
    genealogy: Option<Vec<DatasetRow>>,
}

impl std::fmt::Debug for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("key", &self.row.key)
            .field("type", &self.row.dataset_type)
            .field("is_finished", &self.row.is_finished)
            .finish()
    }
}

impl Dataset {
    fn from_row(row: DatasetRow, store: Arc<dyn Store>, data_dir: PathBuf) -> Self {
        let parameters = match &row.parameters {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };

        Self {
            row,
            parameters,
            store,
            data_dir,
            status_final: false,
            genealogy: None,
        }
    }

    fn sibling(&self, row: DatasetRow) -> Dataset {
        Dataset::from_row(row, self.store.clone(), self.data_dir.clone())
    }

    async fn save(&mut self) -> DatasetResult<()> {
        self.row.parameters = Value::Object(self.parameters.clone());
        if !self.store.update_dataset(&self.row).await? {
            return Err(DatasetError::NotFound(self.row.key.clone()));
        }
        Ok(())
    }

    /// Re-read the row from the store, keeping the in-memory status latch
    pub async fn refresh(&mut self) -> DatasetResult<()> {
        let row = self
            .store
            .fetch_dataset(&self.row.key)
            .await?
            .ok_or_else(|| DatasetError::NotFound(self.row.key.clone()))?;
        self.parameters = match &row.parameters {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        self.row = row;
        Ok(())
    }

    pub fn key(&self) -> &str {
        &self.row.key
    }

    pub fn dataset_type(&self) -> &str {
        &self.row.dataset_type
    }

    pub fn key_parent(&self) -> Option<&str> {
        self.row.key_parent.as_deref()
    }

    pub fn is_top_level(&self) -> bool {
        self.row.key_parent.is_none()
    }

    /// Label shown to users
    pub fn label(&self) -> &str {
        &self.row.query
    }

    pub fn status(&self) -> &str {
        &self.row.status
    }

    pub fn is_finished(&self) -> bool {
        self.row.is_finished
    }

    /// Row count; only meaningful once finished
    pub fn num_rows(&self) -> i64 {
        self.row.num_rows
    }

    pub fn progress(&self) -> f64 {
        self.row.progress
    }

    pub fn timestamp(&self) -> i64 {
        self.row.timestamp
    }

    pub fn software_version(&self) -> &str {
        &self.row.software_version
    }

    pub fn owner(&self) -> &str {
        &self.row.owner
    }

    pub fn is_private(&self) -> bool {
        self.row.is_private
    }

    pub fn result_file(&self) -> &str {
        &self.row.result_file
    }

    pub fn row(&self) -> &DatasetRow {
        &self.row
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    pub fn parameters(&self) -> &Map<String, Value> {
        &self.parameters
    }

    pub fn get_parameter(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub async fn set_parameter(&mut self, name: impl Into<String>, value: Value) -> DatasetResult<()> {
        self.parameters.insert(name.into(), value);
        self.save().await
    }

    /// Remove a parameter for good; returns the old value
    pub async fn delete_parameter(&mut self, name: &str) -> DatasetResult<Option<Value>> {
        let removed = self.parameters.remove(name);
        if removed.is_some() {
            self.save().await?;
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Overwrite the status message
    ///
    /// After an update with `is_final` set, later updates through this handle
    /// are ignored. Returns whether the status was written.
    pub async fn update_status(&mut self, status: impl Into<String>, is_final: bool) -> DatasetResult<bool> {
        if self.status_final {
            return Ok(false);
        }

        self.row.status = status.into();
        self.save().await?;

        if is_final {
            self.status_final = true;
        }
        Ok(true)
    }

    pub async fn update_progress(&mut self, fraction: f64) -> DatasetResult<()> {
        self.row.progress = fraction.clamp(0.0, 1.0);
        self.save().await
    }

    /// Record which software version produced this dataset
    pub async fn update_version(&mut self, version: &str) -> DatasetResult<()> {
        self.row.software_version = version.to_string();
        self.save().await
    }

    // ------------------------------------------------------------------
    // Finished state
    // ------------------------------------------------------------------

    pub async fn finish(&mut self, num_rows: i64) -> DatasetResult<()> {
        if self.row.is_finished {
            return Err(DatasetError::AlreadyFinished(self.row.key.clone()));
        }

        self.row.is_finished = true;
        self.row.num_rows = num_rows;
        self.row.progress = 1.0;
        self.save().await?;

        debug!(key = %self.row.key, num_rows, "Dataset finished");
        Ok(())
    }

    /// Return a finished dataset to the unfinished state for re-processing
    ///
    /// Also lifts the final-status latch of this handle, so the re-run can
    /// report progress again.
    pub async fn unfinish(&mut self) -> DatasetResult<()> {
        if !self.row.is_finished {
            return Err(DatasetError::NotFinished(self.row.key.clone()));
        }

        self.remove_result_file().await?;

        self.row.timestamp = unix_now();
        self.row.is_finished = false;
        self.row.num_rows = 0;
        self.row.progress = 0.0;
        self.row.status = STATUS_QUEUED.to_string();
        self.status_final = false;
        self.save().await
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    /// Pick and record a result file name that is free on disk
    pub async fn reserve_result_file(&mut self, extension: &str) -> DatasetResult<PathBuf> {
        if self.row.is_finished {
            return Err(DatasetError::AlreadyFinished(self.row.key.clone()));
        }

        let stem = files::result_stem(&self.parameters, &self.row.query, &self.row.key);
        let data_dir = self.data_dir.clone();
        let extension = extension.to_string();
        let name = tokio::task::spawn_blocking(move || {
            files::reserve_file_name(&data_dir, &stem, &extension)
        })
        .await
        .map_err(std::io::Error::other)??;

        self.row.result_file = name;
        self.save().await?;
        Ok(self.results_path())
    }

    pub fn results_path(&self) -> PathBuf {
        self.data_dir.join(&self.row.result_file)
    }

    pub fn log_path(&self) -> PathBuf {
        files::log_path_for(&self.results_path())
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Delete the result file; a missing file is fine
    pub async fn remove_result_file(&self) -> DatasetResult<bool> {
        if self.row.result_file.is_empty() {
            return Ok(false);
        }
        Ok(files::remove_if_exists(&self.results_path()).await?)
    }

    /// Append a timestamped line to the dataset log
    pub async fn log(&self, message: &str) -> DatasetResult<()> {
        if self.row.result_file.is_empty() {
            return Ok(());
        }

        let line = format!(
            "{}: {}\n",
            chrono::Utc::now().format("%d-%m-%Y %H:%M:%S"),
            message
        );
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        // tokio writes in the background until flushed
        file.flush().await?;
        Ok(())
    }

    pub async fn clear_log(&self) -> DatasetResult<()> {
        if self.row.result_file.is_empty() {
            return Ok(());
        }
        tokio::fs::File::create(self.log_path()).await?;
        Ok(())
    }

    /// Create a fresh scratch directory for this dataset
    pub async fn staging_area(&self) -> DatasetResult<PathBuf> {
        Ok(files::create_staging_area(&self.data_dir, &self.row.key).await?)
    }

    pub async fn remove_staging_areas(&self) -> DatasetResult<usize> {
        Ok(files::remove_staging_areas(&self.data_dir, &self.row.key).await?)
    }

    // ------------------------------------------------------------------
    // Lineage
    // ------------------------------------------------------------------

    /// The parent dataset, `None` for top-level datasets
    ///
    /// A parent link pointing at a missing row is [`DatasetError::NotFound`].
    pub async fn get_parent(&self) -> DatasetResult<Option<Dataset>> {
        let Some(parent_key) = self.row.key_parent.as_deref() else {
            return Ok(None);
        };

        match self.store.fetch_dataset(parent_key).await? {
            Some(row) => Ok(Some(self.sibling(row))),
            None => Err(DatasetError::NotFound(parent_key.to_string())),
        }
    }

    /// Ancestors from the root down, ending with this dataset
    ///
    /// A missing ancestor ends the walk; the result is then partial.
    pub async fn get_genealogy(&mut self) -> DatasetResult<Vec<Dataset>> {
        if self.genealogy.is_none() {
            let mut chain = Vec::new();
            let mut next = self.row.key_parent.clone();

            while let Some(key) = next {
                // guard against a corrupt cycle in the stored links
                if key == self.row.key || chain.iter().any(|r: &DatasetRow| r.key == key) {
                    warn!(key = %self.row.key, "Cycle in dataset parent links");
                    break;
                }

                match self.store.fetch_dataset(&key).await {
                    Ok(Some(row)) => {
                        next = row.key_parent.clone();
                        chain.push(row);
                    },
                    Ok(None) => {
                        debug!(key = %key, "Ancestor missing, genealogy is partial");
                        break;
                    },
                    Err(e) => {
                        warn!(key = %key, error = %e, "Ancestor lookup failed, genealogy is partial");
                        break;
                    },
                }
            }

            chain.reverse();
            self.genealogy = Some(chain);
        }

        let mut genealogy: Vec<Dataset> = self
            .genealogy
            .iter()
            .flatten()
            .map(|row| self.sibling(row.clone()))
            .collect();
        genealogy.push(self.clone());
        Ok(genealogy)
    }

    /// Oldest reachable ancestor, or this dataset when top-level
    pub async fn top_parent(&mut self) -> DatasetResult<Dataset> {
        let genealogy = self.get_genealogy().await?;
        Ok(genealogy.into_iter().next().unwrap_or_else(|| self.clone()))
    }

    /// Direct children, oldest first
    pub async fn get_children(&self) -> DatasetResult<Vec<Dataset>> {
        let rows = self.store.fetch_children(&self.row.key).await?;
        Ok(rows.into_iter().map(|row| self.sibling(row)).collect())
    }

    /// Re-parent this dataset under `parent_key`
    pub async fn link_parent(&mut self, parent_key: &str) -> DatasetResult<()> {
        if self.store.fetch_dataset(parent_key).await?.is_none() {
            return Err(DatasetError::NotFound(parent_key.to_string()));
        }

        self.row.key_parent = Some(parent_key.to_string());
        self.genealogy = None;
        self.save().await
    }

    /// Make this a top-level dataset
    pub async fn detach(&mut self) -> DatasetResult<()> {
        self.row.key_parent = None;
        self.genealogy = None;
        self.save().await
    }

    /// Delete this dataset and everything derived from it
    ///
    /// Removes descendants first, then this row. For every removed dataset
    /// the outstanding jobs, result file, log and staging areas go too.
    pub async fn delete(self) -> DatasetResult<usize> {
        let mut order = Vec::new();
        let mut pending = VecDeque::from([self.row.clone()]);

        while let Some(row) = pending.pop_front() {
            for child in self.store.fetch_children(&row.key).await? {
                if !order.iter().any(|r: &DatasetRow| r.key == child.key) {
                    pending.push_back(child);
                }
            }
            order.push(row);
        }

        let mut deleted = 0;
        for row in order.into_iter().rev() {
            let dataset = self.sibling(row);
            dataset.remove_own_data().await?;
            deleted += 1;
        }

        info!(key = %self.row.key, deleted, "Dataset deleted");
        Ok(deleted)
    }

    async fn remove_own_data(&self) -> DatasetResult<()> {
        let jobs = self.store.delete_jobs_by_remote_id(&self.row.key).await?;
        if jobs > 0 {
            debug!(key = %self.row.key, jobs, "Removed outstanding jobs");
        }

        self.store.delete_dataset(&self.row.key).await?;

        if !self.row.result_file.is_empty() {
            files::remove_if_exists(&self.results_path()).await?;
            files::remove_if_exists(&self.log_path()).await?;
        }
        self.remove_staging_areas().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Follow-up processors
    // ------------------------------------------------------------------

    /// Processor types that accept this dataset as input
    pub fn get_compatible_processors(
        &self,
        registry: &ProcessorRegistry,
    ) -> BTreeMap<String, ProcessorInfo> {
        registry
            .iter()
            .filter(|processor| processor.is_compatible_with(self))
            .map(|processor| {
                let info = processor.info().clone();
                (info.processor_type.clone(), info)
            })
            .collect()
    }

    /// Compatible processors, minus option-less ones that already produced
    /// a finished child of this dataset
    pub async fn get_available_processors(
        &self,
        registry: &ProcessorRegistry,
    ) -> DatasetResult<BTreeMap<String, ProcessorInfo>> {
        let mut available = self.get_compatible_processors(registry);
        let children = self.store.fetch_children(&self.row.key).await?;

        for child in children.iter().filter(|c| c.is_finished) {
            let Some(processor) = registry.get(&child.dataset_type) else {
                continue;
            };
            if processor.options(Some(self)).is_empty() {
                available.remove(&child.dataset_type);
            }
        }

        Ok(available)
    }
}
