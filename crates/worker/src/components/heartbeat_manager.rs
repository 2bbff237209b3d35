use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info};

use coordinator_core::{
    models::{RunnerHeartbeat, RunnerStatus},
    CoordinatorResult,
};
use coordinator_dispatcher::PresenceRegistry;

use super::JobExecutionManager;

/// 定期向在线状态注册表上报Runner状态
pub struct HeartbeatManager {
    runner_id: String,
    registry: Arc<PresenceRegistry>,
    heartbeat_interval: Duration,
}

impl HeartbeatManager {
    pub fn new(runner_id: String, registry: Arc<PresenceRegistry>, heartbeat_interval: Duration) -> Self {
        Self {
            runner_id,
            registry,
            heartbeat_interval,
        }
    }

    /// 没有执行中的任务为 idle，否则为 busy
    pub fn derive_status(active_jobs: u32) -> RunnerStatus {
        if active_jobs == 0 {
            RunnerStatus::Idle
        } else {
            RunnerStatus::Busy
        }
    }

    pub fn send_heartbeat(&self, active_jobs: u32) -> CoordinatorResult<()> {
        self.registry.heartbeat(RunnerHeartbeat {
            runner_id: self.runner_id.clone(),
            status: Self::derive_status(active_jobs),
            active_jobs,
            timestamp: Utc::now(),
        })
    }

    pub fn start_heartbeat_task(
        self: Arc<Self>,
        execution: Arc<JobExecutionManager>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.heartbeat_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let active_jobs = execution.active_jobs().await;
                        match self.send_heartbeat(active_jobs) {
                            Ok(()) => debug!(runner_id = %self.runner_id, active_jobs, "已发送心跳"),
                            Err(e) => error!("发送心跳失败: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!(runner_id = %self.runner_id, "心跳任务退出");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_derived_from_active_jobs() {
        assert_eq!(HeartbeatManager::derive_status(0), RunnerStatus::Idle);
        assert_eq!(HeartbeatManager::derive_status(2), RunnerStatus::Busy);
    }
}
