use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use coordinator_core::config::PresenceConfig;
use coordinator_core::models::{
    BroadcastEvent, Job, JobPhase, JobProgress, JobStatus, Metadata, RunnerAnnouncement,
    RunnerHeartbeat, RunnerStatus,
};
use coordinator_dispatcher::{
    compute_distribution, BroadcastView, DistributionSnapshot, HeatmapLimits, PresenceRegistry,
};
use futures::future::join_all;

fn registry(timeout_seconds: i64) -> PresenceRegistry {
    PresenceRegistry::new(PresenceConfig {
        heartbeat_timeout_seconds: timeout_seconds,
        ..PresenceConfig::default()
    })
}

fn announce(registry: &PresenceRegistry, runner_id: &str) {
    registry
        .announce(RunnerAnnouncement {
            runner_id: runner_id.to_string(),
            runner_name: runner_id.to_string(),
            status: None,
            metadata: Metadata::new(),
        })
        .unwrap();
}

fn job_with_status(index: usize, status: JobStatus) -> Job {
    let mut job = Job::new(
        format!("job-{index}"),
        vec!["A".to_string(), "B".to_string(), "C".to_string()],
        vec!["amazon".to_string()],
        false,
        3,
        Metadata::new(),
    );
    job.status = status;
    if status != JobStatus::Pending {
        job.runner_id = Some(format!("runner-{}", index % 3));
    }
    if status.is_terminal() {
        job.completed_at = Some(job.created_at + Duration::seconds(60));
    }
    job
}

#[tokio::test]
async fn test_silent_runner_goes_offline_after_timeout() {
    let registry = registry(30);
    announce(&registry, "R3");

    let start = Utc::now();
    for i in 1..=3 {
        let received_at = start + Duration::seconds(i * 10);
        registry
            .heartbeat_at(
                RunnerHeartbeat {
                    runner_id: "R3".to_string(),
                    status: RunnerStatus::Busy,
                    active_jobs: 1,
                    timestamp: received_at,
                },
                received_at,
            )
            .unwrap();
    }

    let during = registry.snapshot_at(start + Duration::seconds(40));
    assert_eq!(during["R3"].status, RunnerStatus::Busy);

    // 最后一次心跳在 start+30，超时窗口为30秒
    let after = registry.snapshot_at(start + Duration::seconds(61));
    assert_eq!(after["R3"].status, RunnerStatus::Offline);
    assert!(!after["R3"].is_active());
}

#[tokio::test]
async fn test_concurrent_heartbeats_from_many_runners() {
    let registry = Arc::new(registry(90));
    let beats = (0..50).map(|i| {
        let registry = registry.clone();
        tokio::spawn(async move {
            let runner_id = format!("runner-{i}");
            announce(&registry, &runner_id);
            for n in 0..5 {
                registry
                    .heartbeat(RunnerHeartbeat {
                        runner_id: runner_id.clone(),
                        status: RunnerStatus::Busy,
                        active_jobs: n,
                        timestamp: Utc::now(),
                    })
                    .unwrap();
            }
        })
    });
    for result in join_all(beats).await {
        result.unwrap();
    }

    let stats = registry.stats();
    assert_eq!(stats.total, 50);
    assert_eq!(stats.busy, 50);
    assert_eq!(stats.total_active_jobs, 200);
}

#[test]
fn test_mixed_jobs_distribution() {
    let mut jobs = Vec::new();
    let layout = [
        (JobStatus::Completed, 4),
        (JobStatus::Failed, 2),
        (JobStatus::Cancelled, 1),
        (JobStatus::Running, 2),
        (JobStatus::Pending, 1),
    ];
    for (status, count) in layout {
        for _ in 0..count {
            let index = jobs.len();
            jobs.push(job_with_status(index, status));
        }
    }

    let stats = compute_distribution(&jobs);
    let counts = stats.counts;
    assert_eq!(counts.total, 10);
    assert_eq!(
        counts.completed + counts.failed + counts.cancelled + counts.running + counts.pending,
        counts.total
    );
    assert_eq!(stats.success_rate, 57);
    assert_eq!(stats.total_skus, 30);
    assert_eq!(stats.avg_skus_per_job, 3.0);
    assert_eq!(stats.unique_runners, 3);
    // 4 个完成任务各3个SKU、各用时1分钟
    assert_eq!(stats.items_per_minute, 3.0);
}

#[test]
fn test_empty_distribution_has_zero_success_rate() {
    let stats = compute_distribution(&[]);
    assert_eq!(stats.counts.total, 0);
    assert_eq!(stats.success_rate, 0);
    assert_eq!(stats.avg_skus_per_job, 0.0);
}

#[tokio::test]
async fn test_snapshot_merges_presence_jobs_and_progress() {
    let registry = registry(90);
    announce(&registry, "runner-0");
    announce(&registry, "runner-1");

    let mut running = job_with_status(0, JobStatus::Running);
    running.heartbeat_at = Some(Utc::now());
    running.lease_expires_at = Some(Utc::now() + Duration::seconds(300));
    let mut stuck = job_with_status(1, JobStatus::Running);
    stuck.lease_expires_at = Some(Utc::now() - Duration::seconds(5));
    let jobs = vec![running.clone(), stuck, job_with_status(2, JobStatus::Pending)];

    let mut broadcast = BroadcastView::default();
    broadcast.apply(&BroadcastEvent::JobProgress(
        JobProgress::new(&running.id, "runner-0", 40, JobPhase::Scraping).unwrap(),
    ));

    let snapshot = DistributionSnapshot::build(
        &registry.snapshot(),
        &jobs,
        Some(&broadcast),
        HeatmapLimits::default(),
        600,
        Utc::now(),
    );

    assert_eq!(snapshot.stats.counts.total, 3);
    assert_eq!(snapshot.presence.total, 2);
    assert_eq!(
        snapshot.runner_loads,
        HashMap::from([("runner-0".to_string(), 1), ("runner-1".to_string(), 1)])
    );
    assert_eq!(snapshot.heatmap.len(), 2);
    let row = snapshot
        .heatmap
        .iter()
        .find(|row| row.runner_id == "runner-0")
        .unwrap();
    assert_eq!(row.jobs[0].progress, Some(40));
    assert_eq!(snapshot.stale_jobs.len(), 1);
    assert_eq!(snapshot.stale_jobs[0].job_id, "job-1");
}
