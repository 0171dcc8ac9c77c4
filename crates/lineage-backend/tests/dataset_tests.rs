//! Dataset lifecycle: keys, files, finish state, lineage and deletion

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::TestEnv;
use serde_json::{json, Map, Value};

use lineage_backend::dataset::files::result_stem;
use lineage_backend::dataset::key::dataset_key;
use lineage_backend::dataset::{DatasetError, NewDataset, DEFAULT_LABEL, STATUS_QUEUED};
use lineage_backend::queue::NewJob;
use lineage_backend::store::Store;

fn params(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

// ============================================================================
// Creation and keys
// ============================================================================

#[tokio::test]
async fn test_identical_requests_share_a_dataset() {
    let env = TestEnv::new();

    let first = env.search("rain in spain", 10).await;
    let second = env.search("rain in spain", 10).await;
    let other = env.search("rain in spain", 11).await;

    assert_eq!(first.key(), second.key());
    assert_ne!(first.key(), other.key());
    assert_eq!(env.store.dataset_count().await, 2);
}

#[tokio::test]
async fn test_parent_is_part_of_the_key() {
    let env = TestEnv::new();
    let a = env.search("a", 1).await;
    let b = env.search("b", 1).await;

    let under_a = env.child(&a, "count-words").await;
    let under_b = env.child(&b, "count-words").await;
    assert_ne!(under_a.key(), under_b.key());
}

#[tokio::test]
async fn test_random_samples_never_deduplicate() {
    let env = TestEnv::new();
    let new = || {
        NewDataset::new("search")
            .parameter("body_match", json!("sample"))
            .parameter("random_amount", json!(100))
    };

    let first = env.create(new()).await;
    let second = env.create(new()).await;

    assert_ne!(first.key(), second.key());
    assert_eq!(env.store.dataset_count().await, 2);
    assert!(first.result_file().starts_with("random-100-"));
}

#[tokio::test]
async fn test_new_dataset_defaults() {
    let env = TestEnv::new();
    let dataset = env.search("Rain in Spain", 3).await;

    assert_eq!(dataset.label(), "Rain in Spain");
    assert_eq!(dataset.status(), STATUS_QUEUED);
    assert!(!dataset.is_finished());
    assert!(dataset.is_top_level());
    assert!(dataset.is_private());
    assert_eq!(dataset.owner(), "anonymous");
    assert!(dataset.result_file().ends_with(&format!("-{}.csv", dataset.key())));
    assert!(dataset.results_path().exists());
}

// ============================================================================
// Result files
// ============================================================================

#[tokio::test]
async fn test_result_file_skips_names_taken_on_disk() {
    let env = TestEnv::new();
    let parameters = params(json!({"rows": 2, "type": "search"}));

    let key = dataset_key(&parameters, DEFAULT_LABEL, None).unwrap();
    let stem = result_stem(&parameters, DEFAULT_LABEL, &key);
    std::fs::create_dir_all(env.datasets.data_dir()).unwrap();
    std::fs::write(env.datasets.data_dir().join(format!("{}.csv", stem)), "old").unwrap();

    let dataset = env
        .create(NewDataset::new("search").parameters(parameters))
        .await;

    assert_eq!(dataset.key(), key);
    assert_eq!(dataset.result_file(), format!("{}-1.csv", stem));
}

#[tokio::test]
async fn test_reservations_never_collide() {
    let env = TestEnv::new();
    let mut dataset = env.search("collide", 1).await;
    let first = dataset.results_path();

    let second = dataset.reserve_result_file("csv").await.unwrap();
    let third = dataset.reserve_result_file("csv").await.unwrap();

    assert_ne!(first, second);
    assert_ne!(second, third);
    assert!(first.exists() && second.exists() && third.exists());
    assert_eq!(dataset.results_path(), third);
}

#[tokio::test]
async fn test_log_and_clear_log() {
    let env = TestEnv::new();
    let dataset = env.search("logging", 1).await;

    dataset.log("first line").await.unwrap();
    dataset.log("second line").await.unwrap();
    let log = std::fs::read_to_string(dataset.log_path()).unwrap();
    assert_eq!(log.lines().count(), 2);
    assert!(log.lines().next().unwrap().ends_with(": first line"));

    dataset.clear_log().await.unwrap();
    assert_eq!(std::fs::read_to_string(dataset.log_path()).unwrap(), "");
}

#[tokio::test]
async fn test_log_lines_are_on_disk_when_log_returns() {
    let env = TestEnv::new();
    let dataset = env.search("log order", 1).await;

    for round in 0..20 {
        dataset.clear_log().await.unwrap();
        for i in 0..10 {
            dataset.log(&format!("round {round} line {i}")).await.unwrap();
        }

        let log = std::fs::read_to_string(dataset.log_path()).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 10, "round {round}: {log:?}");
        for (i, line) in lines.iter().enumerate() {
            assert!(line.ends_with(&format!(": round {round} line {i}")), "round {round}: {log:?}");
        }
    }
}

#[tokio::test]
async fn test_staging_areas() {
    let env = TestEnv::new();
    let dataset = env.search("staging", 1).await;

    let a = dataset.staging_area().await.unwrap();
    let b = dataset.staging_area().await.unwrap();
    assert_ne!(a, b);
    std::fs::write(a.join("part.json"), "{}").unwrap();

    assert_eq!(dataset.remove_staging_areas().await.unwrap(), 2);
    assert!(!a.exists() && !b.exists());
}

// ============================================================================
// Finished state and status
// ============================================================================

#[tokio::test]
async fn test_finish_twice_fails() {
    let env = TestEnv::new();
    let mut dataset = env.search("twice", 1).await;

    dataset.finish(5).await.unwrap();
    assert!(matches!(
        dataset.finish(6).await,
        Err(DatasetError::AlreadyFinished(_))
    ));
    assert!(matches!(
        dataset.reserve_result_file("csv").await,
        Err(DatasetError::AlreadyFinished(_))
    ));
    assert_eq!(env.reload(&dataset).await.num_rows(), 5);
}

#[tokio::test]
async fn test_unfinish_round_trip() {
    let env = TestEnv::new();
    let mut dataset = env.search("again", 1).await;

    assert!(matches!(
        dataset.unfinish().await,
        Err(DatasetError::NotFinished(_))
    ));

    std::fs::write(dataset.results_path(), "id\n1\n").unwrap();
    dataset.finish(1).await.unwrap();
    dataset.update_status("Frozen", true).await.unwrap();

    dataset.unfinish().await.unwrap();
    assert!(!dataset.is_finished());
    assert_eq!(dataset.num_rows(), 0);
    assert_eq!(dataset.status(), STATUS_QUEUED);
    assert!(!dataset.results_path().exists());

    // the latch is reset as well
    assert!(dataset.update_status("Running again", false).await.unwrap());

    dataset.finish(2).await.unwrap();
    let stored = env.reload(&dataset).await;
    assert!(stored.is_finished());
    assert_eq!(stored.num_rows(), 2);
}

#[tokio::test]
async fn test_final_status_latches() {
    let env = TestEnv::new();
    let mut dataset = env.search("latch", 1).await;

    assert!(dataset.update_status("Working", false).await.unwrap());
    assert!(dataset.update_status("Gave up", true).await.unwrap());
    assert!(!dataset.update_status("Working again", false).await.unwrap());

    assert_eq!(dataset.status(), "Gave up");
    assert_eq!(env.reload(&dataset).await.status(), "Gave up");
}

#[tokio::test]
async fn test_progress_is_clamped() {
    let env = TestEnv::new();
    let mut dataset = env.search("progress", 1).await;

    dataset.update_progress(1.7).await.unwrap();
    assert_eq!(dataset.progress(), 1.0);
    dataset.update_progress(-0.2).await.unwrap();
    assert_eq!(env.reload(&dataset).await.progress(), 0.0);
}

#[tokio::test]
async fn test_parameters_persist() {
    let env = TestEnv::new();
    let mut dataset = env.search("params", 1).await;

    dataset.set_parameter("job", json!(42)).await.unwrap();
    assert_eq!(env.datasets.get_by_job(42).await.unwrap().key(), dataset.key());

    assert_eq!(
        dataset.delete_parameter("job").await.unwrap(),
        Some(json!(42))
    );
    assert_eq!(dataset.delete_parameter("job").await.unwrap(), None);
    assert!(env.reload(&dataset).await.get_parameter("job").is_none());
    assert!(matches!(
        env.datasets.get_by_job(42).await,
        Err(DatasetError::NotFound(_))
    ));
}

// ============================================================================
// Lineage
// ============================================================================

#[tokio::test]
async fn test_genealogy_root_first() {
    let env = TestEnv::new();
    let root = env.search("root", 1).await;
    let mid = env.child(&root, "count-words").await;
    let mut leaf = env.child(&mid, "top-words").await;

    let keys: Vec<String> = leaf
        .get_genealogy()
        .await
        .unwrap()
        .iter()
        .map(|d| d.key().to_string())
        .collect();
    assert_eq!(keys, vec![root.key(), mid.key(), leaf.key()]);
    assert_eq!(leaf.top_parent().await.unwrap().key(), root.key());

    let mut root = root;
    assert_eq!(root.get_genealogy().await.unwrap().len(), 1);
    assert_eq!(root.top_parent().await.unwrap().key(), root.key());
}

#[tokio::test]
async fn test_genealogy_is_partial_when_an_ancestor_is_missing() {
    let env = TestEnv::new();
    let root = env.search("root", 1).await;
    let mid = env.child(&root, "count-words").await;
    let leaf = env.child(&mid, "top-words").await;

    env.store.delete_dataset(mid.key()).await.unwrap();

    let mut leaf = env.reload(&leaf).await;
    let genealogy = leaf.get_genealogy().await.unwrap();
    assert_eq!(genealogy.len(), 1);
    assert_eq!(genealogy[0].key(), leaf.key());

    assert!(matches!(
        leaf.get_parent().await,
        Err(DatasetError::NotFound(key)) if key == mid.key()
    ));
}

#[tokio::test]
async fn test_genealogy_is_cached_per_handle() {
    let env = TestEnv::new();
    let root = env.search("root", 1).await;
    let mut leaf = env.child(&root, "count-words").await;

    assert_eq!(leaf.get_genealogy().await.unwrap().len(), 2);
    env.store.delete_dataset(root.key()).await.unwrap();
    assert_eq!(leaf.get_genealogy().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_link_parent_and_detach() {
    let env = TestEnv::new();
    let first = env.search("first", 1).await;
    let second = env.search("second", 1).await;
    let mut child = env.child(&first, "count-words").await;

    assert!(matches!(
        child.link_parent("missing").await,
        Err(DatasetError::NotFound(_))
    ));

    child.link_parent(second.key()).await.unwrap();
    assert_eq!(child.key_parent(), Some(second.key()));
    assert_eq!(second.get_children().await.unwrap().len(), 1);
    assert!(first.get_children().await.unwrap().is_empty());

    child.detach().await.unwrap();
    assert!(env.reload(&child).await.is_top_level());
    assert!(child.get_parent().await.unwrap().is_none());
}

// ============================================================================
// Deletion
// ============================================================================

#[tokio::test]
async fn test_delete_cascades_to_descendants() {
    let env = TestEnv::new();
    let root = env.search("root", 1).await;
    let left = env.child(&root, "count-words").await;
    let right = env.child(&root, "top-words").await;
    let grandchild = env.child(&left, "top-words").await;
    let unrelated = env.search("unrelated", 1).await;

    for dataset in [&root, &left, &right, &grandchild] {
        dataset.log("created").await.unwrap();
        env.queue_for(dataset).await;
    }
    let staging = grandchild.staging_area().await.unwrap();
    let paths: Vec<_> = [&root, &left, &right, &grandchild]
        .iter()
        .flat_map(|d| [d.results_path(), d.log_path()])
        .collect();

    let deleted = root.delete().await.unwrap();

    assert_eq!(deleted, 4);
    assert_eq!(env.store.dataset_count().await, 1);
    assert_eq!(env.store.job_count().await, 0);
    assert!(paths.iter().all(|p| !p.exists()));
    assert!(!staging.exists());
    assert!(unrelated.results_path().exists());
}

#[tokio::test]
async fn test_delete_leaf_only() {
    let env = TestEnv::new();
    let root = env.search("root", 1).await;
    let leaf = env.child(&root, "count-words").await;
    env.queue
        .add(NewJob::new("count-words", leaf.key()))
        .await
        .unwrap();

    assert_eq!(leaf.delete().await.unwrap(), 1);
    assert_eq!(env.store.dataset_count().await, 1);
    assert_eq!(env.store.job_count().await, 0);
    assert!(root.get_children().await.unwrap().is_empty());
}

// ============================================================================
// Processor availability
// ============================================================================

#[tokio::test]
async fn test_compatible_processors() {
    let env = TestEnv::new();
    let search = env.search("compat", 1).await;

    let compatible = search.get_compatible_processors(&env.registry);
    assert!(compatible.contains_key("count-words"));
    assert!(compatible.contains_key("preset-words"));
    assert!(compatible.contains_key("top-words"));
    // top-level only
    assert!(!compatible.contains_key("search"));

    let words = env.child(&search, "count-words").await;
    let compatible = words.get_compatible_processors(&env.registry);
    assert!(!compatible.contains_key("count-words"));
    assert!(compatible.contains_key("top-words"));
}

#[tokio::test]
async fn test_finished_option_less_children_are_not_offered_again() {
    let env = TestEnv::new();
    let search = env.search("available", 1).await;

    let mut words = env.child(&search, "count-words").await;
    let mut secret = env.child(&search, "with-secret").await;

    let available = search.get_available_processors(&env.registry).await.unwrap();
    assert!(available.contains_key("count-words"));

    words.finish(1).await.unwrap();
    secret.finish(1).await.unwrap();

    let available = search.get_available_processors(&env.registry).await.unwrap();
    assert!(!available.contains_key("count-words"));
    assert!(available.contains_key("with-secret"));
    assert!(available.contains_key("top-words"));
}
