//! Registry: race-free lazy initialization, unknown pipelines, init
//! failure recovery, and shutdown.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use aleph_core::kernel::jobs::{
    EchoWorker, JobStatus, RegistryError, Worker, WorkerDescriptor, WorkerRegistry,
};

use common::*;

fn registry(harness: &Harness) -> WorkerRegistry {
    WorkerRegistry::new(
        harness.repository.clone(),
        harness.events.clone(),
        test_options(),
    )
}

#[tokio::test]
async fn concurrent_gets_share_one_factory_invocation() {
    let harness = Harness::new();
    let invocations = Arc::new(AtomicU32::new(0));

    let counter = invocations.clone();
    let mut registry = registry(&harness);
    registry.register(WorkerDescriptor::new("slow-init", "Slow Init", move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Arc::new(EchoWorker) as Arc<dyn Worker>)
        }
    }));
    let registry = Arc::new(registry);

    let mut handles = Vec::new();
    for _ in 0..50 {
        let registry = registry.clone();
        handles.push(tokio::spawn(
            async move { registry.get("slow-init").await },
        ));
    }

    let mut executors = Vec::new();
    for handle in handles {
        executors.push(handle.await.unwrap().expect("get must succeed"));
    }

    // Exactly one factory invocation survives; everyone shares the instance.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    let first = &executors[0];
    assert!(executors.iter().all(|e| Arc::ptr_eq(first, e)));
}

#[tokio::test]
async fn fifty_concurrent_triggers_all_succeed_on_one_executor() {
    let harness = Harness::new();
    let invocations = Arc::new(AtomicU32::new(0));

    let counter = invocations.clone();
    let mut registry = registry(&harness);
    registry.register(WorkerDescriptor::new("slow-init", "Slow Init", move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Arc::new(EchoWorker) as Arc<dyn Worker>)
        }
    }));
    let registry = Arc::new(registry);

    let mut handles = Vec::new();
    for i in 0..50 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let executor = registry.get("slow-init").await?;
            executor
                .create_job(json!({ "i": i }), None)
                .await
                .map_err(|e| RegistryError::InitFailed {
                    pipeline_id: "slow-init".to_string(),
                    reason: e.to_string(),
                })
        }));
    }

    let mut job_ids = Vec::new();
    for handle in handles {
        let job = handle.await.unwrap().expect("trigger must succeed");
        job_ids.push(job.job_id);
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    for job_id in &job_ids {
        let job = wait_for_terminal(&harness.repository, job_id, Duration::from_secs(10)).await;
        assert_eq!(job.status, JobStatus::Completed);
    }
}

#[tokio::test]
async fn unknown_pipeline_fails_fast_with_known_ids() {
    let harness = Harness::new();
    let mut registry = registry(&harness);
    registry.register(WorkerDescriptor::new("echo", "Echo", || async {
        Ok(Arc::new(EchoWorker) as Arc<dyn Worker>)
    }));

    match registry.get("nope").await {
        Err(RegistryError::UnknownPipeline { pipeline_id, known }) => {
            assert_eq!(pipeline_id, "nope");
            assert_eq!(known, vec!["echo".to_string()]);
        }
        other => panic!("expected UnknownPipeline, got {other:?}"),
    }
    assert!(!registry.is_registered("nope"));
    assert!(registry.is_registered("echo"));
}

#[tokio::test]
async fn failed_initialization_is_retried_on_the_next_get() {
    let harness = Harness::new();
    let attempts = Arc::new(AtomicU32::new(0));

    let counter = attempts.clone();
    let mut registry = registry(&harness);
    registry.register(WorkerDescriptor::new("fragile", "Fragile", move || {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("factory cold-start failure");
            }
            Ok(Arc::new(EchoWorker) as Arc<dyn Worker>)
        }
    }));

    // First resolution fails and must not park an errored future.
    assert!(matches!(
        registry.get("fragile").await,
        Err(RegistryError::InitFailed { .. })
    ));

    // Second resolution re-runs the factory and succeeds.
    let executor = registry.get("fragile").await.unwrap();
    assert_eq!(executor.pipeline_id(), "fragile");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn pipelines_reports_instantiation_state() {
    let harness = Harness::new();
    let mut registry = registry(&harness);
    registry.register(WorkerDescriptor::new("echo", "Echo", || async {
        Ok(Arc::new(EchoWorker) as Arc<dyn Worker>)
    }));
    registry.register(WorkerDescriptor::new("idle", "Idle", || async {
        Ok(Arc::new(EchoWorker) as Arc<dyn Worker>)
    }));

    registry.get("echo").await.unwrap();

    let pipelines = registry.pipelines();
    assert_eq!(pipelines.len(), 2);
    let echo = pipelines.iter().find(|p| p.id == "echo").unwrap();
    let idle = pipelines.iter().find(|p| p.id == "idle").unwrap();
    assert!(echo.registered);
    assert!(!idle.registered);

    let stats = registry.stats();
    assert!(stats.contains_key("echo"));
    assert!(!stats.contains_key("idle"));
}

#[tokio::test]
async fn shutdown_all_clears_the_cache() {
    let harness = Harness::new();
    let mut registry = registry(&harness);
    registry.register(WorkerDescriptor::new("echo", "Echo", || async {
        Ok(Arc::new(EchoWorker) as Arc<dyn Worker>)
    }));

    let executor = registry.get("echo").await.unwrap();
    let job = executor.create_job(json!({}), None).await.unwrap();
    wait_for_terminal(&harness.repository, &job.job_id, Duration::from_secs(5)).await;

    registry.shutdown_all(Duration::from_secs(1)).await;

    let pipelines = registry.pipelines();
    assert!(pipelines.iter().all(|p| !p.registered));

    // A later get builds a fresh executor.
    let rebuilt = registry.get("echo").await.unwrap();
    assert!(!Arc::ptr_eq(&executor, &rebuilt));
}
