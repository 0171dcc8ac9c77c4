//! Built-in processors

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::TestEnv;
use std::sync::Arc;

use lineage_backend::dataset::NewDataset;
use lineage_backend::processors::{builtin_registry, CountRows};
use lineage_backend::worker::WorkerOutcome;

fn env() -> TestEnv {
    let mut env = TestEnv::new();
    env.registry = Arc::new(builtin_registry());
    env
}

#[tokio::test]
async fn test_count_rows_counts_data_lines() {
    let env = env();
    let mut upload = env
        .create(NewDataset::new("upload").label("survey.csv"))
        .await;
    std::fs::write(upload.results_path(), "id,answer\n1,yes\n\n2,no\n3,maybe\n").unwrap();
    upload.finish(3).await.unwrap();

    let counted = env.child(&upload, CountRows::TYPE).await;
    assert_eq!(env.produce(&counted).await, WorkerOutcome::Completed);

    let counted = env.reload(&counted).await;
    assert!(counted.is_finished());
    assert_eq!(counted.num_rows(), 1);
    assert_eq!(
        std::fs::read_to_string(counted.results_path()).unwrap(),
        "rows\n3\n"
    );
    // option defaults are not written back
    assert!(counted.get_parameter("skip_empty").is_none());
}

#[tokio::test]
async fn test_count_rows_with_empty_lines_kept() {
    let env = env();
    let mut upload = env.create(NewDataset::new("upload").label("blank")).await;
    std::fs::write(upload.results_path(), "id\n1\n\n2\n").unwrap();
    upload.finish(2).await.unwrap();

    let counted = env
        .create(
            NewDataset::new(CountRows::TYPE)
                .parent(upload.key())
                .parameter("skip_empty", serde_json::json!(false)),
        )
        .await;
    env.produce(&counted).await;

    let counted = env.reload(&counted).await;
    assert_eq!(
        std::fs::read_to_string(counted.results_path()).unwrap(),
        "rows\n3\n"
    );
}

#[tokio::test]
async fn test_count_rows_only_offered_for_csv() {
    let env = env();
    let csv = env.create(NewDataset::new("upload").label("a")).await;
    let json = env
        .create(NewDataset::new("upload").label("b").extension("json"))
        .await;

    assert!(csv
        .get_compatible_processors(&env.registry)
        .contains_key(CountRows::TYPE));
    assert!(json.get_compatible_processors(&env.registry).is_empty());
}
