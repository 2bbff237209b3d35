use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use coordinator_core::{
    models::{BroadcastEvent, Job, JobAssignedNotice, JobStatus, ScrapeLogLevel},
    traits::BroadcastPublisher,
    CoordinatorError, CoordinatorResult,
};
use coordinator_dispatcher::JobLifecycleService;

use super::ProgressReporter;
use crate::executor::JobExecutor;

/// 管理本Runner已认领任务的执行: 租约续期、进度广播和终态上报
pub struct JobExecutionManager {
    runner_id: String,
    runner_name: String,
    lifecycle: Arc<dyn JobLifecycleService>,
    publisher: Arc<dyn BroadcastPublisher>,
    executor: Arc<dyn JobExecutor>,
    max_concurrent_jobs: usize,
    lease_interval: Duration,
    running_jobs: Arc<RwLock<HashMap<String, Job>>>,
    jobs_processed: AtomicU64,
}

impl JobExecutionManager {
    pub fn new(
        runner_id: String,
        runner_name: String,
        lifecycle: Arc<dyn JobLifecycleService>,
        publisher: Arc<dyn BroadcastPublisher>,
        executor: Arc<dyn JobExecutor>,
        max_concurrent_jobs: usize,
        lease_interval: Duration,
    ) -> Self {
        Self {
            runner_id,
            runner_name,
            lifecycle,
            publisher,
            executor,
            max_concurrent_jobs: max_concurrent_jobs.max(1),
            lease_interval,
            running_jobs: Arc::new(RwLock::new(HashMap::new())),
            jobs_processed: AtomicU64::new(0),
        }
    }

    pub async fn active_jobs(&self) -> u32 {
        self.running_jobs.read().await.len() as u32
    }

    pub async fn can_accept_job(&self) -> bool {
        self.running_jobs.read().await.len() < self.max_concurrent_jobs
    }

    pub async fn running_job_ids(&self) -> Vec<String> {
        self.running_jobs.read().await.keys().cloned().collect()
    }

    pub fn jobs_processed(&self) -> u64 {
        self.jobs_processed.load(Ordering::Relaxed)
    }

    /// 在开始执行前占用并发名额
    pub async fn register(&self, job: &Job) {
        self.running_jobs
            .write()
            .await
            .insert(job.id.clone(), job.clone());
    }

    /// 执行已认领的任务并上报终态。
    /// 任务已不属于本Runner时返回 `NotOwner`，结果被丢弃而不会改写任务。
    pub async fn execute(&self, job: Job) -> CoordinatorResult<Job> {
        self.register(&job).await;
        let job_id = job.id.clone();

        info!(
            job_id = %job_id,
            runner_id = %self.runner_id,
            executor = self.executor.name(),
            skus = job.skus.len(),
            "开始执行任务"
        );
        self.publisher.publish(BroadcastEvent::JobAssigned(JobAssignedNotice {
            job_id: job_id.clone(),
            runner_id: self.runner_id.clone(),
            runner_name: self.runner_name.clone(),
            scrapers: job.scrapers.clone(),
            skus_count: job.skus.len(),
            timestamp: Utc::now(),
        }));

        let reporter = ProgressReporter::new(self.publisher.clone(), &job_id, &self.runner_id);
        reporter.log(ScrapeLogLevel::Info, format!("开始抓取 {} 个SKU", job.skus.len()));

        let lease = self.spawn_lease_heartbeat(job_id.clone());
        let result = self.executor.execute(&job, &reporter).await;
        lease.abort();

        let (status, error_message) = match result {
            Ok(outcome) => (outcome.status, outcome.error_message),
            Err(e) => {
                error!(job_id = %job_id, "任务执行出错: {}", e);
                (JobStatus::Failed, Some(e.to_string()))
            }
        };
        if let Some(message) = &error_message {
            reporter.log(ScrapeLogLevel::Error, message.clone());
        }

        let reported = self
            .lifecycle
            .report_terminal(&job_id, &self.runner_id, status, error_message)
            .await;

        self.running_jobs.write().await.remove(&job_id);
        self.jobs_processed.fetch_add(1, Ordering::Relaxed);

        match &reported {
            Ok(job) => {
                reporter.log(ScrapeLogLevel::Info, format!("任务结束: {}", job.status));
                info!(job_id = %job_id, status = %job.status, "任务终态已上报");
            }
            Err(CoordinatorError::NotOwner { owner, .. }) => {
                warn!(job_id = %job_id, owner = ?owner, "任务已不属于本Runner，丢弃执行结果");
            }
            Err(e) => {
                error!(job_id = %job_id, "上报任务终态失败: {}", e);
            }
        }
        reported
    }

    fn spawn_lease_heartbeat(&self, job_id: String) -> tokio::task::JoinHandle<()> {
        let lifecycle = self.lifecycle.clone();
        let runner_id = self.runner_id.clone();
        let period = self.lease_interval;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                match lifecycle.heartbeat_job(&job_id, &runner_id).await {
                    Ok(_) => debug!(job_id = %job_id, "任务租约已续期"),
                    Err(e @ CoordinatorError::NotOwner { .. })
                    | Err(e @ CoordinatorError::InvalidTransition { .. }) => {
                        warn!(job_id = %job_id, "停止续期任务租约: {}", e);
                        break;
                    }
                    Err(e) => error!(job_id = %job_id, "续期任务租约失败: {}", e),
                }
            }
        })
    }
}
