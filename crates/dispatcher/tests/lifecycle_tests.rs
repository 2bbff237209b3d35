use std::collections::HashSet;
use std::sync::Arc;

use coordinator_core::config::CoordinatorConfig;
use coordinator_core::models::{JobOptions, JobStatus, JobSubmission};
use coordinator_core::{CoordinatorError, JobRepository};
use coordinator_dispatcher::{JobLifecycleEngine, JobLifecycleService};
use coordinator_infrastructure::{ChangeNotifier, InMemoryJobRepository};
use futures::future::join_all;

mod repository_test_utils;
use repository_test_utils::FlakyRepository;

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn engine() -> Arc<JobLifecycleEngine> {
    let repo: Arc<dyn JobRepository> = Arc::new(InMemoryJobRepository::new(ChangeNotifier::new(256)));
    Arc::new(JobLifecycleEngine::new(repo, CoordinatorConfig::default()))
}

#[tokio::test]
async fn test_create_job_single_chunk() {
    let engine = engine();
    let job = engine
        .create_job(strings(&["A", "B", "C"]), strings(&["amazon"]), JobOptions::default())
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.runner_id, None);
    assert_eq!(job.max_workers, 3);

    let chunks = engine.list_chunks(&job.id).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].skus, strings(&["A", "B", "C"]));
    assert_eq!(chunks[0].status, JobStatus::Pending);
}

#[tokio::test]
async fn test_create_job_validation_creates_nothing() {
    let engine = engine();
    let empty_skus = engine
        .create_job(vec![], strings(&["amazon"]), JobOptions::default())
        .await;
    assert!(matches!(empty_skus, Err(CoordinatorError::Validation(_))));

    let empty_scrapers = engine
        .create_job(strings(&["A"]), vec![], JobOptions::default())
        .await;
    assert!(matches!(empty_scrapers, Err(CoordinatorError::Validation(_))));

    let bad_workers = engine
        .create_job(
            strings(&["A"]),
            strings(&["amazon"]),
            JobOptions {
                max_workers: Some(0),
                ..JobOptions::default()
            },
        )
        .await;
    assert!(matches!(bad_workers, Err(CoordinatorError::Validation(_))));

    let all = engine
        .list_jobs(&Default::default())
        .await
        .unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn test_chunks_cover_skus_exactly() {
    let engine = engine();
    let skus: Vec<String> = (0..23).map(|i| format!("SKU-{i}")).collect();
    let job = engine
        .create_job(
            skus.clone(),
            strings(&["amazon", "walmart"]),
            JobOptions {
                chunk_size: Some(5),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    let chunks = engine.list_chunks(&job.id).await.unwrap();
    assert_eq!(chunks.len(), 5);
    let covered: Vec<String> = chunks.into_iter().flat_map(|c| c.skus).collect();
    assert_eq!(covered, skus);
}

#[tokio::test]
async fn test_submission_splits_round_robin() {
    let engine = engine();
    let skus: Vec<String> = (0..7).map(|i| format!("SKU-{i}")).collect();
    let receipt = engine
        .submit_jobs(JobSubmission {
            skus: skus.clone(),
            scrapers: strings(&["amazon"]),
            test_mode: Some(true),
            max_workers: None,
            metadata: None,
            max_runners: Some(3),
        })
        .await
        .unwrap();

    assert_eq!(receipt.job_ids.len(), 3);
    assert_eq!(receipt.status, JobStatus::Pending);

    let mut covered = Vec::new();
    for job_id in &receipt.job_ids {
        let job = engine.get_job(job_id).await.unwrap();
        assert!(job.test_mode);
        covered.extend(job.skus);
    }
    covered.sort();
    let mut expected = skus;
    expected.sort();
    assert_eq!(covered, expected);
}

#[tokio::test]
async fn test_concurrent_claims_have_single_winner() {
    let engine = engine();
    let job = engine
        .create_job(strings(&["A"]), strings(&["amazon"]), JobOptions::default())
        .await
        .unwrap();

    let attempts = (0..32).map(|i| {
        let engine = engine.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move { engine.claim_job(&job_id, &format!("runner-{i}")).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let losers = results
        .iter()
        .filter(|r| matches!(r, Err(CoordinatorError::AlreadyClaimed { .. })))
        .count();
    assert_eq!(losers, 31);

    let stored = engine.get_job(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.runner_id, winners[0].runner_id);
}

#[tokio::test]
async fn test_non_owner_report_is_rejected() {
    let engine = engine();
    let job = engine
        .create_job(strings(&["A"]), strings(&["amazon"]), JobOptions::default())
        .await
        .unwrap();
    engine.claim_job(&job.id, "R1").await.unwrap();

    let result = engine
        .report_terminal(&job.id, "R2", JobStatus::Completed, None)
        .await;
    assert!(matches!(result, Err(CoordinatorError::NotOwner { .. })));

    let stored = engine.get_job(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.runner_id.as_deref(), Some("R1"));
    assert_eq!(stored.version, 2);
}

#[tokio::test]
async fn test_failed_report_then_claim_fails() {
    let engine = engine();
    let job = engine
        .create_job(strings(&["A"]), strings(&["amazon"]), JobOptions::default())
        .await
        .unwrap();
    engine.claim_job(&job.id, "R1").await.unwrap();

    let failed = engine
        .report_terminal(&job.id, "R1", JobStatus::Failed, Some("timeout".to_string()))
        .await
        .unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("timeout"));
    assert!(failed.completed_at.is_some());

    assert!(engine.claim_job(&job.id, "R2").await.is_err());

    // 终态不可再改变
    for status in [JobStatus::Completed, JobStatus::Cancelled] {
        assert!(engine.report_terminal(&job.id, "R1", status, None).await.is_err());
    }
    let stored = engine.get_job(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.runner_id.as_deref(), Some("R1"));
    assert_eq!(stored.completed_at, failed.completed_at);

    let chunks = engine.list_chunks(&job.id).await.unwrap();
    assert!(chunks.iter().all(|c| c.status == JobStatus::Failed));
}

#[tokio::test]
async fn test_cancel_pending_without_owner() {
    let engine = engine();
    let job = engine
        .create_job(strings(&["A"]), strings(&["amazon"]), JobOptions::default())
        .await
        .unwrap();

    let cancelled = engine
        .report_terminal(&job.id, "dashboard", JobStatus::Cancelled, None)
        .await
        .unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(matches!(
        engine.claim_job(&job.id, "R1").await,
        Err(CoordinatorError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_cancel_races_claim() {
    let engine = engine();
    for _ in 0..20 {
        let job = engine
            .create_job(strings(&["A"]), strings(&["amazon"]), JobOptions::default())
            .await
            .unwrap();

        let claim = {
            let engine = engine.clone();
            let job_id = job.id.clone();
            tokio::spawn(async move { engine.claim_job(&job_id, "R1").await })
        };
        let cancel = {
            let engine = engine.clone();
            let job_id = job.id.clone();
            tokio::spawn(async move {
                engine
                    .report_terminal(&job_id, "other", JobStatus::Cancelled, None)
                    .await
            })
        };
        let (claimed, cancelled) = (claim.await.unwrap(), cancel.await.unwrap());
        assert!(claimed.is_ok() != cancelled.is_ok());

        let stored = engine.get_job(&job.id).await.unwrap();
        if claimed.is_ok() {
            assert_eq!(stored.status, JobStatus::Running);
        } else {
            assert_eq!(stored.status, JobStatus::Cancelled);
        }
    }
}

#[tokio::test]
async fn test_claim_next_oldest_first_with_scraper_filter() {
    let engine = engine();
    let first = engine
        .create_job(strings(&["A"]), strings(&["amazon"]), JobOptions::default())
        .await
        .unwrap();
    let second = engine
        .create_job(strings(&["B"]), strings(&["walmart"]), JobOptions::default())
        .await
        .unwrap();

    let walmart = strings(&["walmart"]);
    let claimed = engine.claim_next("R1", Some(&walmart)).await.unwrap().unwrap();
    assert_eq!(claimed.id, second.id);
    assert!(engine.claim_next("R1", Some(&walmart)).await.unwrap().is_none());

    let claimed = engine.claim_next("R2", None).await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert!(engine.claim_next("R2", None).await.unwrap().is_none());
}

#[tokio::test]
async fn test_concurrent_claim_next_distributes_jobs() {
    let engine = engine();
    for i in 0..10 {
        engine
            .create_job(strings(&[&format!("SKU-{i}")]), strings(&["amazon"]), JobOptions::default())
            .await
            .unwrap();
    }

    let runners = (0..10).map(|i| {
        let engine = engine.clone();
        tokio::spawn(async move { engine.claim_next(&format!("runner-{i}"), None).await })
    });
    let claimed: Vec<_> = join_all(runners)
        .await
        .into_iter()
        .filter_map(|r| r.unwrap().unwrap())
        .collect();

    let ids: HashSet<_> = claimed.iter().map(|j| j.id.clone()).collect();
    assert_eq!(ids.len(), claimed.len());
    assert_eq!(claimed.len(), 10);
}

#[tokio::test]
async fn test_job_lease_heartbeat() {
    let engine = engine();
    let job = engine
        .create_job(strings(&["A"]), strings(&["amazon"]), JobOptions::default())
        .await
        .unwrap();

    assert!(matches!(
        engine.heartbeat_job(&job.id, "R1").await,
        Err(CoordinatorError::NotOwner { .. })
    ));

    let claimed = engine.claim_job(&job.id, "R1").await.unwrap();
    let beat = engine.heartbeat_job(&job.id, "R1").await.unwrap();
    assert!(beat.heartbeat_at.is_some());
    assert!(beat.lease_expires_at >= claimed.lease_expires_at);
    assert!(beat.version > claimed.version);

    assert!(matches!(
        engine.heartbeat_job(&job.id, "R2").await,
        Err(CoordinatorError::NotOwner { .. })
    ));

    engine
        .report_terminal(&job.id, "R1", JobStatus::Completed, None)
        .await
        .unwrap();
    assert!(matches!(
        engine.heartbeat_job(&job.id, "R1").await,
        Err(CoordinatorError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_chunk_reports_finalize_job() {
    let engine = engine();
    let job = engine
        .create_job(
            strings(&["A", "B", "C", "D"]),
            strings(&["amazon"]),
            JobOptions {
                chunk_size: Some(2),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(matches!(
        engine.start_chunk(&job.id, 0, "R1").await,
        Err(CoordinatorError::NotOwner { .. })
    ));

    engine.claim_job(&job.id, "R1").await.unwrap();
    let chunk = engine.start_chunk(&job.id, 0, "R1").await.unwrap();
    assert_eq!(chunk.status, JobStatus::Running);
    assert!(matches!(
        engine.start_chunk(&job.id, 9, "R1").await,
        Err(CoordinatorError::ChunkNotFound { .. })
    ));

    let first = engine
        .report_chunk(&job.id, 0, "R1", JobStatus::Completed)
        .await
        .unwrap();
    assert!(first.finalized_job.is_none());

    let last = engine
        .report_chunk(&job.id, 1, "R1", JobStatus::Failed)
        .await
        .unwrap();
    let finalized = last.finalized_job.unwrap();
    assert_eq!(finalized.status, JobStatus::Failed);
    assert!(finalized.error_message.is_some());
}

#[tokio::test]
async fn test_chunk_store_failure_keeps_job_running() {
    let repo = FlakyRepository::new();
    let engine = JobLifecycleEngine::new(repo.clone(), CoordinatorConfig::default());
    let job = engine
        .create_job(
            strings(&["A", "B", "C", "D"]),
            strings(&["amazon"]),
            JobOptions {
                chunk_size: Some(2),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();
    engine.claim_job(&job.id, "R1").await.unwrap();

    repo.fail_chunk_updates(true);
    let result = engine
        .report_terminal(&job.id, "R1", JobStatus::Completed, None)
        .await;
    assert!(matches!(result, Err(CoordinatorError::StoreUnavailable(_))));

    // 任务不能先于分片进入终态
    let stored = engine.get_job(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.runner_id.as_deref(), Some("R1"));
    let chunks = engine.list_chunks(&job.id).await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert!(chunks.iter().all(|c| c.status == JobStatus::Pending));

    // 存储恢复后Runner重试上报
    repo.fail_chunk_updates(false);
    let completed = engine
        .report_terminal(&job.id, "R1", JobStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
    let chunks = engine.list_chunks(&job.id).await.unwrap();
    assert!(chunks.iter().all(|c| c.status == JobStatus::Completed));
}

#[tokio::test]
async fn test_cancel_pending_reports_chunk_store_failure() {
    let repo = FlakyRepository::new();
    let engine = JobLifecycleEngine::new(repo.clone(), CoordinatorConfig::default());
    let job = engine
        .create_job(
            strings(&["A", "B"]),
            strings(&["amazon"]),
            JobOptions {
                chunk_size: Some(1),
                ..JobOptions::default()
            },
        )
        .await
        .unwrap();

    repo.fail_chunk_updates(true);
    let result = engine
        .report_terminal(&job.id, "dashboard", JobStatus::Cancelled, None)
        .await;
    assert!(matches!(result, Err(CoordinatorError::StoreUnavailable(_))));

    // 未认领的任务已取消，不会再被认领
    assert_eq!(engine.get_job(&job.id).await.unwrap().status, JobStatus::Cancelled);
    assert!(engine.claim_job(&job.id, "R1").await.is_err());
}
