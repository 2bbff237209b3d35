use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use coordinator_core::config::{CoordinatorConfig, PresenceConfig, RunnerConfig};
use coordinator_core::models::{
    BroadcastEvent, Job, JobOptions, JobPhase, JobProgress, JobStatus, RunnerStatus,
};
use coordinator_core::{BroadcastPublisher, CoordinatorError, CoordinatorResult, JobRepository};
use coordinator_dispatcher::{
    BroadcastView, JobLifecycleEngine, JobLifecycleService, PresenceRegistry,
};
use coordinator_infrastructure::{BroadcastHub, ChangeNotifier, InMemoryJobRepository};
use coordinator_worker::{
    ExecutionOutcome, JobExecutionManager, JobExecutor, ProgressReporter, RunnerAgent,
    RunnerAgentBuilder, SimulatedExecutor,
};
use futures::future::join_all;
use tokio::sync::broadcast;

struct FixedExecutor {
    outcome: CoordinatorResult<ExecutionOutcome>,
}

#[async_trait]
impl JobExecutor for FixedExecutor {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn execute(&self, job: &Job, reporter: &ProgressReporter) -> CoordinatorResult<ExecutionOutcome> {
        reporter.progress(job.skus.len() as u32, job.skus.len() as u32, JobPhase::Complete);
        match &self.outcome {
            Ok(outcome) => Ok(outcome.clone()),
            Err(e) => Err(CoordinatorError::Internal(e.to_string())),
        }
    }
}

struct Harness {
    engine: Arc<JobLifecycleEngine>,
    registry: Arc<PresenceRegistry>,
    hub: Arc<BroadcastHub>,
}

impl Harness {
    fn new() -> Self {
        let repo: Arc<dyn JobRepository> =
            Arc::new(InMemoryJobRepository::new(ChangeNotifier::new(256)));
        Self {
            engine: Arc::new(JobLifecycleEngine::new(repo, CoordinatorConfig::default())),
            registry: Arc::new(PresenceRegistry::new(PresenceConfig::default())),
            hub: Arc::new(BroadcastHub::new(1024)),
        }
    }

    fn agent(&self, runner_id: &str, executor: Arc<dyn JobExecutor>) -> RunnerAgent {
        let config = RunnerConfig {
            runner_id: runner_id.to_string(),
            runner_name: format!("{runner_id}-name"),
            ..RunnerConfig::default()
        };
        RunnerAgentBuilder::new(
            config,
            self.engine.clone(),
            self.registry.clone(),
            self.hub.clone(),
        )
        .executor(executor)
        .poll_interval(Duration::from_millis(10))
        .heartbeat_interval(Duration::from_millis(10))
        .hostname("test-host".to_string())
        .build()
    }

    async fn create_job(&self, skus: &[&str]) -> Job {
        self.engine
            .create_job(
                skus.iter().map(|s| s.to_string()).collect(),
                vec!["amazon".to_string()],
                JobOptions::default(),
            )
            .await
            .unwrap()
    }
}

fn completes() -> Arc<dyn JobExecutor> {
    Arc::new(FixedExecutor {
        outcome: Ok(ExecutionOutcome::completed(1)),
    })
}

#[tokio::test]
async fn test_run_once_executes_and_reports() {
    let harness = Harness::new();
    let mut events = harness.hub.subscribe();
    let job = harness.create_job(&["A", "B"]).await;

    let agent = harness.agent(
        "R1",
        Arc::new(SimulatedExecutor::new(Duration::from_millis(1), 0.0)),
    );
    let finished = agent.run_once().await.unwrap().unwrap();
    assert_eq!(finished.id, job.id);
    assert_eq!(finished.status, JobStatus::Completed);
    assert_eq!(finished.runner_id.as_deref(), Some("R1"));
    assert_eq!(agent.execution().active_jobs().await, 0);
    assert_eq!(agent.execution().jobs_processed(), 1);

    let mut view = BroadcastView::default();
    while let Ok(Ok(event)) =
        tokio::time::timeout(Duration::from_millis(50), events.recv()).await
    {
        view.apply(&event);
    }
    assert!(view.assignment(&job.id).is_some());
    assert_eq!(view.progress(&job.id).map(|p| p.progress), Some(100));
    assert_eq!(view.job_health(&job.id), 100);
    assert!(view.logs_for_job(&job.id).count() > 0);

    assert!(agent.run_once().await.unwrap().is_none());
}

#[tokio::test]
async fn test_executor_error_reports_failed() {
    let harness = Harness::new();
    let job = harness.create_job(&["A"]).await;
    let agent = harness.agent(
        "R1",
        Arc::new(FixedExecutor {
            outcome: Err(CoordinatorError::Internal("浏览器崩溃".to_string())),
        }),
    );

    let finished = agent.run_once().await.unwrap().unwrap();
    assert_eq!(finished.id, job.id);
    assert_eq!(finished.status, JobStatus::Failed);
    assert!(finished.error_message.unwrap().contains("浏览器崩溃"));
}

#[tokio::test]
async fn test_racing_agents_claim_once() {
    let harness = Harness::new();
    harness.create_job(&["A"]).await;

    let agents: Vec<_> = (0..8)
        .map(|i| Arc::new(harness.agent(&format!("R{i}"), completes())))
        .collect();
    let results = join_all(agents.iter().map(|agent| {
        let agent = agent.clone();
        tokio::spawn(async move { agent.try_claim().await })
    }))
    .await;

    let claimed = results
        .into_iter()
        .filter_map(|r| r.unwrap().unwrap())
        .count();
    assert_eq!(claimed, 1);
}

#[tokio::test]
async fn test_stale_result_from_non_owner_is_dropped() {
    let harness = Harness::new();
    let job = harness.create_job(&["A"]).await;
    harness.engine.claim_job(&job.id, "R1").await.unwrap();
    let claimed = harness.engine.get_job(&job.id).await.unwrap();

    let stale = JobExecutionManager::new(
        "R2".to_string(),
        "R2".to_string(),
        harness.engine.clone(),
        harness.hub.clone(),
        completes(),
        1,
        Duration::from_secs(60),
    );
    let result = stale.execute(claimed).await;
    assert!(matches!(result, Err(CoordinatorError::NotOwner { .. })));
    assert_eq!(stale.active_jobs().await, 0);

    let stored = harness.engine.get_job(&job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert_eq!(stored.runner_id.as_deref(), Some("R1"));
}

#[tokio::test]
async fn test_agent_loop_until_shutdown() {
    let harness = Harness::new();
    for i in 0..3 {
        harness.create_job(&[&format!("SKU-{i}")]).await;
    }

    let agent = Arc::new(harness.agent("R1", completes()));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn({
        let agent = agent.clone();
        async move { agent.run(shutdown_rx).await }
    });

    let mut done = 0;
    for _ in 0..300 {
        let jobs = harness.engine.list_jobs(&Default::default()).await.unwrap();
        done = jobs
            .iter()
            .filter(|j| j.status == JobStatus::Completed)
            .count();
        if done == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(done, 3);

    let presence = harness.registry.get("R1").unwrap();
    assert_ne!(presence.status, RunnerStatus::Offline);
    assert_eq!(
        presence.metadata.get("hostname").and_then(|v| v.as_str()),
        Some("test-host")
    );

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
    assert!(!agent.is_running().await);
    assert_eq!(harness.registry.get("R1").unwrap().status, RunnerStatus::Offline);
}

#[tokio::test]
async fn test_broadcast_without_subscribers_is_dropped() {
    let harness = Harness::new();
    let delivered = harness
        .hub
        .publish(BroadcastEvent::JobProgress(
            JobProgress::from_counts("job-1", "R1", 1, 2, JobPhase::Scraping),
        ));
    assert_eq!(delivered, 0);
}
