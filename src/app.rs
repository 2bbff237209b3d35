use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use metrics::gauge;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use coordinator_core::{
    config::{AppConfig, RunnerConfig},
    models::{BroadcastFilter, FeedFilter, JobQuery, JobSubmission, SubmissionReceipt},
    traits::{BroadcastPublisher, JobRepository},
    CoordinatorResult,
};
use coordinator_dispatcher::{
    BroadcastSubscriber, BroadcastView, DistributionSnapshot, HeatmapLimits, JobAssignmentFeed,
    JobLifecycleEngine, JobSubscriber, PresenceMonitor, PresenceRegistry,
};
use coordinator_infrastructure::{
    BroadcastHub, ChangeNotifier, DatabaseManager, InMemoryJobRepository, SqliteJobRepository,
};
use coordinator_worker::RunnerAgentBuilder;

/// 演示提交中每个Runner分到的SKU数
const DEMO_SKUS_PER_RUNNER: usize = 4;

/// 协调器进程: 任务存储、生命周期引擎、分配流、广播通道和在线状态注册表
pub struct Application {
    config: AppConfig,
    database: Option<DatabaseManager>,
    repo: Arc<dyn JobRepository>,
    engine: Arc<JobLifecycleEngine>,
    feed: Arc<JobAssignmentFeed>,
    hub: Arc<BroadcastHub>,
    registry: Arc<PresenceRegistry>,
    demo_runners: usize,
}

impl Application {
    /// 创建新的应用实例，`demo_runners` 为进程内启动的演示Runner数量
    pub async fn new(config: AppConfig, demo_runners: usize) -> Result<Self> {
        info!(url = %config.database.url, demo_runners, "初始化协调器");

        let notifier = ChangeNotifier::new(config.feed.channel_capacity);
        let (database, repo): (Option<DatabaseManager>, Arc<dyn JobRepository>) =
            if config.database.is_memory() {
                info!("使用内存任务存储，进程退出后数据丢失");
                (None, Arc::new(InMemoryJobRepository::new(notifier)))
            } else {
                let database = DatabaseManager::new(&config.database).await?;
                let repo = SqliteJobRepository::new(database.pool().clone(), notifier);
                repo.migrate().await.context("初始化数据库表结构失败")?;
                (Some(database), Arc::new(repo))
            };

        let engine = Arc::new(JobLifecycleEngine::new(
            repo.clone(),
            config.coordinator.clone(),
        ));
        let feed = Arc::new(JobAssignmentFeed::new(config.feed.channel_capacity));
        let hub = Arc::new(BroadcastHub::new(config.broadcast.channel_capacity));
        let registry = Arc::new(PresenceRegistry::new(config.presence.clone()));

        Ok(Self {
            config,
            database,
            repo,
            engine,
            feed,
            hub,
            registry,
            demo_runners,
        })
    }

    pub fn engine(&self) -> Arc<JobLifecycleEngine> {
        self.engine.clone()
    }

    pub fn feed(&self) -> Arc<JobAssignmentFeed> {
        self.feed.clone()
    }

    pub fn broadcast_hub(&self) -> Arc<BroadcastHub> {
        self.hub.clone()
    }

    pub fn presence(&self) -> Arc<PresenceRegistry> {
        self.registry.clone()
    }

    /// 创建订阅整体分配流的看板订阅者
    pub fn job_subscriber(&self, filter: FeedFilter) -> JobSubscriber {
        JobSubscriber::new(self.repo.clone(), self.feed.clone(), filter, &self.config.feed)
    }

    /// 以当前存储和在线状态生成看板快照
    pub async fn distribution_snapshot(
        &self,
        broadcast: Option<&BroadcastView>,
    ) -> CoordinatorResult<DistributionSnapshot> {
        let jobs = self
            .engine
            .list_jobs(&JobQuery::recent(self.config.feed.resync_limit))
            .await?;
        let now = Utc::now();
        Ok(DistributionSnapshot::build(
            &self.registry.snapshot_at(now),
            &jobs,
            broadcast,
            HeatmapLimits::default(),
            self.config.coordinator.stale_job_seconds,
            now,
        ))
    }

    /// 提交一批演示SKU，按Runner数拆分
    pub async fn submit_demo_jobs(&self, runners: usize) -> CoordinatorResult<SubmissionReceipt> {
        let runners = runners.max(1);
        let skus = (0..runners * DEMO_SKUS_PER_RUNNER)
            .map(|i| format!("DEMO-SKU-{:04}", i + 1))
            .collect();
        let scrapers = if self.config.runner.scrapers.is_empty() {
            vec!["demo".to_string()]
        } else {
            self.config.runner.scrapers.clone()
        };

        self.engine
            .submit_jobs(JobSubmission {
                skus,
                scrapers,
                test_mode: Some(true),
                max_workers: None,
                metadata: None,
                max_runners: Some(runners),
            })
            .await
    }

    /// 运行所有后台组件，直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动协调器");
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // 分配流先于任何订阅者启动
        {
            let feed = self.feed.clone();
            let changes = self.repo.subscribe_changes();
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                feed.run(changes, shutdown_rx).await;
            }));
        }

        {
            let monitor = PresenceMonitor::new(self.registry.clone());
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                monitor.run(shutdown_rx).await;
            }));
        }

        let dashboard = Arc::new(self.job_subscriber(FeedFilter::default()));
        {
            let dashboard = dashboard.clone();
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                dashboard.run(shutdown_rx).await;
            }));
        }

        let telemetry = Arc::new(BroadcastSubscriber::new(
            self.hub.clone(),
            BroadcastFilter::default(),
            self.config.broadcast.max_logs,
        ));
        {
            let telemetry = telemetry.clone();
            let shutdown_rx = shutdown_rx.resubscribe();
            handles.push(tokio::spawn(async move {
                telemetry.run(shutdown_rx).await;
            }));
        }

        handles.extend(self.spawn_demo_runners(&shutdown_rx));
        if self.demo_runners > 0 {
            match self.submit_demo_jobs(self.demo_runners).await {
                Ok(receipt) => info!(jobs = receipt.job_ids.len(), "已提交演示任务"),
                Err(e) => warn!("提交演示任务失败: {}", e),
            }
        }

        let summary_interval =
            Duration::from_secs(self.config.presence.detection_interval_seconds);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(summary_interval) => {
                    let view = telemetry.snapshot().await;
                    self.log_summary(&dashboard, &view).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("协调器收到关闭信号");
                    break;
                }
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!("后台任务异常退出: {}", e);
            }
        }

        if let Some(database) = &self.database {
            database.close().await;
        }
        info!("协调器已停止");
        Ok(())
    }

    fn spawn_demo_runners(&self, shutdown_rx: &broadcast::Receiver<()>) -> Vec<JoinHandle<()>> {
        (1..=self.demo_runners)
            .map(|i| {
                let config = RunnerConfig {
                    runner_id: format!("{}-{:02}", self.config.runner.runner_id, i),
                    runner_name: format!("{}-{:02}", self.config.runner.runner_name, i),
                    ..self.config.runner.clone()
                };
                let publisher: Arc<dyn BroadcastPublisher> = self.hub.clone();
                let agent = RunnerAgentBuilder::new(
                    config,
                    self.engine.clone(),
                    self.registry.clone(),
                    publisher,
                )
                .lease_seconds(self.config.coordinator.lease_seconds)
                .build();
                let shutdown_rx = shutdown_rx.resubscribe();

                tokio::spawn(async move {
                    if let Err(e) = agent.run(shutdown_rx).await {
                        error!(runner_id = %agent.runner_id(), "演示Runner退出: {}", e);
                    }
                })
            })
            .collect()
    }

    async fn log_summary(&self, dashboard: &JobSubscriber, telemetry: &BroadcastView) {
        let view = dashboard.snapshot().await;
        match self.distribution_snapshot(Some(telemetry)).await {
            Ok(snapshot) => {
                let counts = view.counts();
                record_gauges(&snapshot);
                info!(
                    view_state = ?view.state(),
                    pending = counts.pending,
                    running = counts.running,
                    completed = counts.completed,
                    failed = counts.failed,
                    runners_online = snapshot.presence.online + snapshot.presence.busy + snapshot.presence.idle,
                    success_rate = snapshot.stats.success_rate,
                    items_per_minute = snapshot.stats.items_per_minute,
                    stale_jobs = snapshot.stale_jobs.len(),
                    "任务分布概况"
                );
                for stale in &snapshot.stale_jobs {
                    warn!(job_id = %stale.job_id, runner_id = ?stale.runner_id, reason = ?stale.reason, "疑似僵死任务");
                }
            }
            Err(e) => warn!("生成任务分布快照失败: {}", e),
        }
    }
}

fn record_gauges(snapshot: &DistributionSnapshot) {
    let counts = &snapshot.stats.counts;
    for (status, value) in [
        ("pending", counts.pending),
        ("running", counts.running),
        ("completed", counts.completed),
        ("failed", counts.failed),
        ("cancelled", counts.cancelled),
    ] {
        gauge!("coordinator_jobs", "status" => status).set(value as f64);
    }
    gauge!("coordinator_stale_jobs").set(snapshot.stale_jobs.len() as f64);
    gauge!("coordinator_items_per_minute").set(snapshot.stats.items_per_minute);
}
