use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use coordinator_core::{
    config::{CoordinatorConfig, RunnerConfig},
    models::{
        BroadcastEvent, Job, Metadata, RunnerAnnouncement, RunnerLifecycle, RunnerPresence,
        RunnerStatus, RunnerStatusNotice,
    },
    traits::BroadcastPublisher,
    CoordinatorError, CoordinatorResult,
};
use coordinator_dispatcher::{JobLifecycleService, PresenceRegistry};

use crate::components::{HeartbeatManager, JobExecutionManager};
use crate::executor::{JobExecutor, SimulatedExecutor};

/// 停机时等待执行中任务结束的最长时间
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// 租约续期间隔: 租约时长的三分之一，至少一秒
pub fn lease_renewal_interval(lease_seconds: i64) -> Duration {
    Duration::from_secs((lease_seconds / 3).max(1) as u64)
}

/// Runner代理构建器
pub struct RunnerAgentBuilder {
    config: RunnerConfig,
    lifecycle: Arc<dyn JobLifecycleService>,
    registry: Arc<PresenceRegistry>,
    publisher: Arc<dyn BroadcastPublisher>,
    executor: Arc<dyn JobExecutor>,
    heartbeat_interval: Duration,
    poll_interval: Duration,
    lease_seconds: i64,
    hostname: String,
}

impl RunnerAgentBuilder {
    pub fn new(
        config: RunnerConfig,
        lifecycle: Arc<dyn JobLifecycleService>,
        registry: Arc<PresenceRegistry>,
        publisher: Arc<dyn BroadcastPublisher>,
    ) -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds),
            poll_interval: Duration::from_secs(config.poll_interval_seconds),
            lease_seconds: CoordinatorConfig::default().lease_seconds,
            config,
            lifecycle,
            registry,
            publisher,
            executor: Arc::new(SimulatedExecutor::default()),
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
        }
    }

    /// 设置任务执行器
    pub fn executor(mut self, executor: Arc<dyn JobExecutor>) -> Self {
        info!("注册任务执行器: {}", executor.name());
        self.executor = executor;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// 协调器授予的任务租约时长，续期间隔由此推导
    pub fn lease_seconds(mut self, lease_seconds: i64) -> Self {
        self.lease_seconds = lease_seconds;
        self
    }

    pub fn hostname(mut self, hostname: String) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn build(self) -> RunnerAgent {
        let execution = Arc::new(JobExecutionManager::new(
            self.config.runner_id.clone(),
            self.config.runner_name.clone(),
            self.lifecycle.clone(),
            self.publisher.clone(),
            self.executor.clone(),
            self.config.max_concurrent_jobs,
            lease_renewal_interval(self.lease_seconds),
        ));
        let heartbeat = Arc::new(HeartbeatManager::new(
            self.config.runner_id.clone(),
            self.registry.clone(),
            self.heartbeat_interval.max(Duration::from_millis(1)),
        ));

        RunnerAgent {
            config: self.config,
            lifecycle: self.lifecycle,
            registry: self.registry,
            publisher: self.publisher,
            executor_name: self.executor.name().to_string(),
            execution,
            heartbeat,
            poll_interval: self.poll_interval,
            hostname: self.hostname,
            is_running: Arc::new(RwLock::new(false)),
        }
    }
}

/// Runner端代理: 上线、心跳、轮询认领、执行并上报
pub struct RunnerAgent {
    config: RunnerConfig,
    lifecycle: Arc<dyn JobLifecycleService>,
    registry: Arc<PresenceRegistry>,
    publisher: Arc<dyn BroadcastPublisher>,
    executor_name: String,
    execution: Arc<JobExecutionManager>,
    heartbeat: Arc<HeartbeatManager>,
    poll_interval: Duration,
    hostname: String,
    is_running: Arc<RwLock<bool>>,
}

impl RunnerAgent {
    pub fn runner_id(&self) -> &str {
        &self.config.runner_id
    }

    pub fn execution(&self) -> Arc<JobExecutionManager> {
        self.execution.clone()
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// 向在线状态注册表宣告上线
    pub fn announce(&self) -> CoordinatorResult<RunnerPresence> {
        let mut metadata = Metadata::new();
        metadata.insert("hostname".to_string(), self.hostname.clone().into());
        metadata.insert("executor".to_string(), self.executor_name.clone().into());
        if !self.config.scrapers.is_empty() {
            metadata.insert("scrapers".to_string(), self.config.scrapers.join(",").into());
        }

        let presence = self.registry.announce(RunnerAnnouncement {
            runner_id: self.config.runner_id.clone(),
            runner_name: self.config.runner_name.clone(),
            status: Some(RunnerStatus::Idle),
            metadata,
        })?;
        self.publish_status(RunnerLifecycle::Online, None);
        Ok(presence)
    }

    fn publish_status(&self, status: RunnerLifecycle, reason: Option<String>) {
        self.publisher.publish(BroadcastEvent::RunnerStatus(RunnerStatusNotice {
            runner_id: self.config.runner_id.clone(),
            runner_name: self.config.runner_name.clone(),
            status,
            reason,
            jobs_processed: Some(self.execution.jobs_processed()),
            timestamp: Utc::now(),
        }));
    }

    /// 认领一个任务并占用并发名额。没有可认领的任务或名额已满时返回 `None`
    pub async fn try_claim(&self) -> CoordinatorResult<Option<Job>> {
        if !self.execution.can_accept_job().await {
            return Ok(None);
        }

        let scrapers = (!self.config.scrapers.is_empty()).then_some(self.config.scrapers.as_slice());
        match self
            .lifecycle
            .claim_next(&self.config.runner_id, scrapers)
            .await
        {
            Ok(Some(job)) => {
                self.execution.register(&job).await;
                Ok(Some(job))
            }
            Ok(None) => Ok(None),
            // 竞争失败不是错误，下一轮继续
            Err(CoordinatorError::AlreadyClaimed { job_id }) => {
                debug!(job_id = %job_id, "任务已被其他Runner认领");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 认领并在当前任务中执行一个任务
    pub async fn run_once(&self) -> CoordinatorResult<Option<Job>> {
        match self.try_claim().await? {
            Some(job) => self.execution.execute(job).await.map(Some),
            None => Ok(None),
        }
    }

    fn next_poll_delay(&self) -> Duration {
        let jitter_ms = (self.poll_interval.as_millis() as u64 / 4).max(1);
        self.poll_interval + Duration::from_millis(rand::rng().random_range(0..jitter_ms))
    }

    /// 运行代理直到收到停机信号，退出前主动断开
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> CoordinatorResult<()> {
        {
            let mut is_running = self.is_running.write().await;
            if *is_running {
                return Err(CoordinatorError::Internal("Runner代理已在运行".to_string()));
            }
            *is_running = true;
        }

        info!(runner_id = %self.config.runner_id, "启动Runner代理");
        self.announce()?;
        let heartbeat = self
            .heartbeat
            .clone()
            .start_heartbeat_task(self.execution.clone(), shutdown.resubscribe());

        let mut tasks: JoinSet<CoordinatorResult<Job>> = JoinSet::new();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.next_poll_delay()) => {
                    match self.try_claim().await {
                        Ok(Some(job)) => {
                            let execution = self.execution.clone();
                            tasks.spawn(async move { execution.execute(job).await });
                        }
                        Ok(None) => {}
                        Err(e) if e.is_store_unavailable() => error!("任务存储不可用，稍后重试: {}", e),
                        Err(e) => warn!("认领任务失败: {}", e),
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("任务执行被中断: {}", e);
                    }
                }
                _ = shutdown.recv() => {
                    info!(runner_id = %self.config.runner_id, "收到停止信号，Runner代理退出");
                    break;
                }
            }
        }

        if !tasks.is_empty() {
            info!("等待 {} 个执行中的任务结束", tasks.len());
            let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                warn!("等待任务结束超时，放弃剩余 {} 个任务", tasks.len());
                tasks.abort_all();
            }
        }

        if let Err(e) = heartbeat.await {
            error!("心跳任务异常退出: {}", e);
        }
        self.publish_status(RunnerLifecycle::Shutdown, Some("收到停止信号".to_string()));
        self.registry.departed(&self.config.runner_id);

        *self.is_running.write().await = false;
        info!(runner_id = %self.config.runner_id, "Runner代理已停止");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_renewal_follows_lease_length() {
        assert_eq!(lease_renewal_interval(300), Duration::from_secs(100));
        assert_eq!(lease_renewal_interval(30), Duration::from_secs(10));
        assert_eq!(lease_renewal_interval(2), Duration::from_secs(1));
        assert_eq!(
            lease_renewal_interval(CoordinatorConfig::default().lease_seconds),
            Duration::from_secs(100)
        );
    }
}
