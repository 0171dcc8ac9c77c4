//! Worker manager dispatch

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::TestEnv;
use std::time::Duration;

use lineage_backend::config::WorkerConfig;
use lineage_backend::dataset::NewDataset;
use lineage_backend::manager::WorkerManager;
use lineage_backend::worker::InterruptLevel;
use serde_json::json;

#[tokio::test]
async fn test_dispatch_runs_jobs_and_their_follow_ups() {
    let env = TestEnv::new();
    let search = env
        .create(
            NewDataset::new("search")
                .parameter("rows", json!(12))
                .parameter("next", json!([{"type": "count-words"}])),
        )
        .await;
    env.queue_for(&search).await;

    let manager = WorkerManager::new(env.runner_env());
    let handle = manager.handle();

    assert_eq!(manager.dispatch_once().await.unwrap(), 1);
    handle.join_all().await;
    assert!(env.reload(&search).await.is_finished());

    assert_eq!(manager.dispatch_once().await.unwrap(), 1);
    handle.join_all().await;

    let children = env.reload(&search).await.get_children().await.unwrap();
    assert_eq!(children.len(), 1);
    assert!(children[0].is_finished());
    assert_eq!(children[0].num_rows(), 12);

    assert_eq!(manager.dispatch_once().await.unwrap(), 0);
    assert_eq!(env.queue.job_count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_dispatch_respects_max_workers() {
    let env = TestEnv::new();
    for label in ["one", "two", "three"] {
        let dataset = env
            .create(NewDataset::new("interruptible").label(label))
            .await;
        env.queue_for(&dataset).await;
    }

    let manager = WorkerManager::new(env.runner_env());
    let handle = manager.handle();

    assert_eq!(manager.dispatch_once().await.unwrap(), 2);
    assert_eq!(manager.dispatch_once().await.unwrap(), 0);
    assert_eq!(handle.running_jobs().await.len(), 2);
    assert_eq!(env.queue.claimable_jobs(None).await.unwrap().len(), 1);

    handle.interrupt_all(InterruptLevel::Cancel).await;
    handle.join_all().await;
    assert_eq!(env.queue.job_count(None).await.unwrap(), 1);

    // the slot is free again for the job that waited
    assert_eq!(manager.dispatch_once().await.unwrap(), 1);
    handle.interrupt_all(InterruptLevel::Cancel).await;
    handle.join_all().await;
    assert_eq!(env.queue.job_count(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_interrupt_single_job() {
    let env = TestEnv::new();
    let dataset = env.create(NewDataset::new("interruptible")).await;
    let job = env.queue_for(&dataset).await;

    let manager = WorkerManager::new(env.runner_env());
    let handle = manager.handle();
    manager.dispatch_once().await.unwrap();

    assert!(!handle.interrupt(job.id + 1000, InterruptLevel::Cancel).await);
    assert!(handle.interrupt(job.id, InterruptLevel::Retry).await);
    handle.join_all().await;

    let job = env.queue.get_job(job.id).await.unwrap();
    assert!(!job.is_claimed());
    assert_eq!(job.attempts, 1);
    assert!(handle.running_jobs().await.is_empty());
}

#[tokio::test]
async fn test_manager_loop_until_shutdown() {
    let env = TestEnv::with_config(WorkerConfig {
        poll_interval_ms: 10,
        ..WorkerConfig::default()
    });
    let search = env.search("background", 3).await;
    let mut stale = env.queue_for(&search).await;
    // a claim left over from a previous process
    env.queue.claim(&mut stale).await.unwrap();

    let manager = WorkerManager::new(env.runner_env());
    let handle = manager.handle();
    let task = manager.start();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !env.reload(&search).await.is_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("search was not processed in time");

    handle.shutdown();
    task.await.unwrap();

    assert_eq!(env.queue.job_count(None).await.unwrap(), 0);
    assert!(handle.running_jobs().await.is_empty());
}

#[tokio::test]
async fn test_shutdown_retries_running_jobs() {
    let env = TestEnv::with_config(WorkerConfig {
        poll_interval_ms: 10,
        ..WorkerConfig::default()
    });
    let dataset = env.create(NewDataset::new("interruptible")).await;
    let job = env.queue_for(&dataset).await;

    let manager = WorkerManager::new(env.runner_env());
    let handle = manager.handle();
    let task = manager.start();

    tokio::time::timeout(Duration::from_secs(5), async {
        while handle.running_jobs().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job was not started in time");

    handle.shutdown();
    task.await.unwrap();

    let job = env.queue.get_job(job.id).await.unwrap();
    assert!(!job.is_claimed());
    assert_eq!(job.attempts, 1);
}
