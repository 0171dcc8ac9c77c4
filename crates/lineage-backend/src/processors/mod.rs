//! Processors shipped with the backend

pub mod count_rows;

use crate::processor::ProcessorRegistry;

pub use count_rows::CountRows;

/// Registry with every built-in processor
pub fn builtin_registry() -> ProcessorRegistry {
    ProcessorRegistry::new().with(CountRows::new())
}
