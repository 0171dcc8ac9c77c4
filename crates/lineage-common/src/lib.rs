//! Lineage Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities for the Lineage workspace.
//!
//! - **Error Handling**: common error and result types
//! - **Logging**: tracing subscriber setup driven by `LOG_*` variables
//! - **Keys**: canonical parameter serialisation and dataset key hashing
//! - **Naming**: filesystem-safe file name stems
//!
//! # Example
//!
//! ```
//! use lineage_common::keys::derive_key;
//! use serde_json::{json, Map, Value};
//!
//! let mut parameters = Map::new();
//! parameters.insert("board".to_string(), json!("v"));
//! let key = derive_key(&parameters, "Query", None).unwrap();
//! assert_eq!(key.len(), 32);
//! ```

pub mod error;
pub mod keys;
pub mod logging;
pub mod naming;

// Re-export commonly used types
pub use error::{LineageError, Result};
