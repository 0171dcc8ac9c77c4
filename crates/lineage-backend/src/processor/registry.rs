//! Processor registry

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Processor, ProcessorInfo};

/// Known processor types, keyed by type name
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: BTreeMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a processor; a later registration of the same type replaces the earlier one
    pub fn register(&mut self, processor: Arc<dyn Processor>) -> &mut Self {
        let processor_type = processor.info().processor_type.clone();
        if self
            .processors
            .insert(processor_type.clone(), processor)
            .is_some()
        {
            warn!(processor_type = %processor_type, "Processor registered twice, keeping the last one");
        } else {
            debug!(processor_type = %processor_type, "Processor registered");
        }
        self
    }

    pub fn with(mut self, processor: impl Processor + 'static) -> Self {
        self.register(Arc::new(processor));
        self
    }

    pub fn get(&self, processor_type: &str) -> Option<&Arc<dyn Processor>> {
        self.processors.get(processor_type)
    }

    pub fn info(&self, processor_type: &str) -> Option<&ProcessorInfo> {
        self.get(processor_type).map(|p| p.info())
    }

    /// Whether `processor_type` is a registered preset
    pub fn is_preset(&self, processor_type: &str) -> bool {
        self.info(processor_type).is_some_and(|info| info.is_preset)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Processor>> {
        self.processors.values()
    }

    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.processors.keys()).finish()
    }
}
