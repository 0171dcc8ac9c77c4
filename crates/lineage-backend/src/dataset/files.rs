//! On-disk layout for dataset results, logs and staging areas
//!
//! Everything lives flat in the data directory:
//!
//! ```text
//! {stem}-{key}.{ext}       result file
//! {stem}-{key}.log         dataset log
//! staging-{key}-{n}/       scratch directories
//! ```

use lineage_common::naming::{join_stem, safe_stem};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use super::key::is_random_sample;

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// File stem for a dataset's result file, without suffix or extension
pub fn result_stem(parameters: &Map<String, Value>, label: &str, key: &str) -> String {
    if is_random_sample(parameters) {
        let amount = parameters
            .get("random_amount")
            .and_then(scalar_text)
            .unwrap_or_default();
        return join_stem(&["random", &safe_stem(&amount), key]);
    }

    if let Some(filter) = parameters.get("filter").and_then(scalar_text) {
        return join_stem(&["filter", &safe_stem(&filter), key]);
    }

    join_stem(&[&safe_stem(label), key])
}

fn file_name(stem: &str, suffix: u32, extension: &str) -> String {
    let stem = if suffix == 0 {
        stem.to_string()
    } else {
        format!("{}-{}", stem, suffix)
    };

    if extension.is_empty() {
        stem
    } else {
        format!("{}.{}", stem, extension.trim_start_matches('.'))
    }
}

/// Claim a free file name in `data_dir`
///
/// Tries `{stem}.{ext}`, then `{stem}-1.{ext}`, `{stem}-2.{ext}`, ...
/// The winning name is created as an empty file in the same step, so two
/// concurrent reservations can never end up with the same path.
pub fn reserve_file_name(data_dir: &Path, stem: &str, extension: &str) -> std::io::Result<String> {
    std::fs::create_dir_all(data_dir)?;

    let mut suffix = 0;
    loop {
        let candidate = file_name(stem, suffix, extension);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(data_dir.join(&candidate))
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Log file that sits next to a result file
pub fn log_path_for(result_path: &Path) -> PathBuf {
    result_path.with_extension("log")
}

/// Name prefix shared by every staging area of a dataset
pub fn staging_prefix(key: &str) -> String {
    format!("staging-{}-", key)
}

/// Create a new, empty staging directory for `key`
pub async fn create_staging_area(data_dir: &Path, key: &str) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(data_dir).await?;

    let prefix = staging_prefix(key);
    let mut n = 0;
    loop {
        let candidate = data_dir.join(format!("{}{}", prefix, n));
        match tokio::fs::create_dir(&candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    }
}

/// Remove every staging directory of `key`; returns how many were removed
pub async fn remove_staging_areas(data_dir: &Path, key: &str) -> std::io::Result<usize> {
    let prefix = staging_prefix(key);
    let mut entries = match tokio::fs::read_dir(data_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(&prefix) && entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Remove a file, treating "already gone" as success
pub async fn remove_if_exists(path: &Path) -> std::io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn params(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_result_stem_variants() {
        assert_eq!(
            result_stem(&Map::new(), "Rain in Spain!", "k1"),
            "rain-in-spain-k1"
        );
        assert_eq!(
            result_stem(&params(json!({"random_amount": 50})), "x", "k2"),
            "random-50-k2"
        );
        assert_eq!(
            result_stem(&params(json!({"filter": "Only Cats"})), "x", "k3"),
            "filter-only-cats-k3"
        );
        // label without usable characters
        assert_eq!(result_stem(&Map::new(), "???", "k4"), "k4");
    }

    #[test]
    fn test_reservation_appends_suffixes() {
        let dir = TempDir::new().unwrap();

        let first = reserve_file_name(dir.path(), "query-abc", "csv").unwrap();
        let second = reserve_file_name(dir.path(), "query-abc", "csv").unwrap();
        let third = reserve_file_name(dir.path(), "query-abc", ".csv").unwrap();

        assert_eq!(first, "query-abc.csv");
        assert_eq!(second, "query-abc-1.csv");
        assert_eq!(third, "query-abc-2.csv");
        assert!(dir.path().join(&second).exists());
    }

    #[test]
    fn test_log_path() {
        assert_eq!(
            log_path_for(Path::new("/data/query-abc.csv")),
            PathBuf::from("/data/query-abc.log")
        );
    }

    #[tokio::test]
    async fn test_staging_areas() {
        let dir = TempDir::new().unwrap();

        let a = create_staging_area(dir.path(), "abc").await.unwrap();
        let b = create_staging_area(dir.path(), "abc").await.unwrap();
        let other = create_staging_area(dir.path(), "abcd").await.unwrap();
        assert_ne!(a, b);

        assert_eq!(remove_staging_areas(dir.path(), "abc").await.unwrap(), 2);
        assert!(!a.exists());
        assert!(other.exists());
    }
}
