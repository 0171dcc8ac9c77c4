//! Dataset labels and keys

use lineage_common::keys::{derive_key, random_key};
use serde_json::{Map, Value};

/// Label used when no parameter describes the dataset
pub const DEFAULT_LABEL: &str = "Query";

fn text<'a>(parameters: &'a Map<String, Value>, name: &str) -> Option<&'a str> {
    parameters
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Human-readable label for a parameter set
///
/// First meaningful field wins: body match, subject match, country filter,
/// file name, `datasource/board`, then `default`.
pub fn derive_label(parameters: &Map<String, Value>, default: &str) -> String {
    if let Some(body) = text(parameters, "body_match") {
        return body.to_string();
    }

    if let Some(subject) = text(parameters, "subject_match") {
        return subject.to_string();
    }

    if let Some(flag) = text(parameters, "country_flag") {
        if flag != "all" {
            return format!("Flag: {}", flag);
        }
    }

    if let Some(filename) = text(parameters, "filename") {
        return filename.to_string();
    }

    if let (Some(datasource), Some(board)) =
        (text(parameters, "datasource"), text(parameters, "board"))
    {
        return format!("{}/{}", datasource, board);
    }

    default.to_string()
}

/// Whether the parameters request a random sample
///
/// Any truthy `random_amount` counts: a non-zero number or a non-empty,
/// non-zero string.
pub fn is_random_sample(parameters: &Map<String, Value>) -> bool {
    match parameters.get("random_amount") {
        Some(Value::Number(n)) => n.as_f64().is_some_and(|n| n != 0.0),
        Some(Value::String(s)) => !s.trim().is_empty() && s.trim() != "0",
        Some(Value::Bool(b)) => *b,
        _ => false,
    }
}

/// Key for a new dataset
///
/// Random samples get a fresh random key, so identical sample requests
/// never collapse into one dataset.
pub fn dataset_key(
    parameters: &Map<String, Value>,
    label: &str,
    parent_key: Option<&str>,
) -> lineage_common::Result<String> {
    if is_random_sample(parameters) {
        return Ok(random_key());
    }
    derive_key(parameters, label, parent_key)
}
