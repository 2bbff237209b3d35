//! Runner在线状态注册表
//!
//! 每个Runner的更新在其 `DashMap` 条目锁内串行执行，不同Runner之间完全并发。
//! 心跳超时在读取快照时惰性判定，不依赖后台任务或其他Runner的活动。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::gauge;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use coordinator_core::{
    config::PresenceConfig,
    models::{PresenceEvent, RunnerAnnouncement, RunnerHeartbeat, RunnerPresence, RunnerStatus},
    traits::Subscription,
    CoordinatorError, CoordinatorResult,
};

use crate::distribution::{compute_presence_stats, PresenceStats};

/// 一次清扫的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    /// 因心跳超时被标记为离线的Runner
    pub demoted: Vec<String>,
    /// 离线超过清理阈值被移除的Runner
    pub removed: Vec<String>,
}

pub struct PresenceRegistry {
    runners: DashMap<String, RunnerPresence>,
    events: broadcast::Sender<PresenceEvent>,
    config: PresenceConfig,
}

impl PresenceRegistry {
    pub fn new(config: PresenceConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            runners: DashMap::new(),
            events,
            config,
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    fn emit(&self, event: PresenceEvent) {
        // 没有订阅者时丢弃
        let _ = self.events.send(event);
    }

    /// 注册或刷新Runner，未上报状态时默认为 idle
    pub fn announce(&self, announcement: RunnerAnnouncement) -> CoordinatorResult<RunnerPresence> {
        if announcement.runner_id.trim().is_empty() {
            return Err(CoordinatorError::validation("Runner ID不能为空"));
        }

        let now = Utc::now();
        let status = announcement.status.unwrap_or(RunnerStatus::Idle);
        match self.runners.entry(announcement.runner_id.clone()) {
            Entry::Occupied(mut entry) => {
                let presence = entry.get_mut();
                presence.runner_name = announcement.runner_name;
                presence.status = status;
                presence.last_seen = now;
                presence.metadata = announcement.metadata;
                let snapshot = presence.clone();
                self.emit(PresenceEvent::Updated {
                    presence: snapshot.clone(),
                });
                debug!(runner_id = %snapshot.runner_id, "Runner重新上线");
                Ok(snapshot)
            }
            Entry::Vacant(entry) => {
                let presence = RunnerPresence {
                    runner_id: announcement.runner_id,
                    runner_name: announcement.runner_name,
                    status,
                    active_jobs: 0,
                    last_seen: now,
                    metadata: announcement.metadata,
                };
                let snapshot = entry.insert(presence).clone();
                self.emit(PresenceEvent::Joined {
                    presence: snapshot.clone(),
                });
                info!(runner_id = %snapshot.runner_id, runner_name = %snapshot.runner_name, "Runner已上线");
                Ok(snapshot)
            }
        }
    }

    /// 处理心跳，存活时间按协调器时钟记录；重复心跳幂等
    pub fn heartbeat(&self, heartbeat: RunnerHeartbeat) -> CoordinatorResult<()> {
        self.heartbeat_at(heartbeat, Utc::now())
    }

    /// 以 `received_at` 作为收到心跳的时间。Runner上报的时间戳不参与存活判定
    pub fn heartbeat_at(
        &self,
        heartbeat: RunnerHeartbeat,
        received_at: DateTime<Utc>,
    ) -> CoordinatorResult<()> {
        if heartbeat.runner_id.trim().is_empty() {
            return Err(CoordinatorError::validation("Runner ID不能为空"));
        }

        let skew = heartbeat.timestamp - received_at;
        if skew.num_seconds().abs() > self.config.heartbeat_timeout_seconds {
            debug!(
                runner_id = %heartbeat.runner_id,
                skew_seconds = skew.num_seconds(),
                "Runner时钟与协调器偏差较大"
            );
        }

        match self.runners.entry(heartbeat.runner_id.clone()) {
            Entry::Occupied(mut entry) => {
                let presence = entry.get_mut();
                presence.status = heartbeat.status;
                presence.active_jobs = heartbeat.active_jobs;
                presence.last_seen = presence.last_seen.max(received_at);
                self.emit(PresenceEvent::Updated {
                    presence: presence.clone(),
                });
            }
            Entry::Vacant(entry) => {
                // 清理后恢复心跳的Runner重新加入
                let presence = RunnerPresence {
                    runner_id: heartbeat.runner_id.clone(),
                    runner_name: heartbeat.runner_id.clone(),
                    status: heartbeat.status,
                    active_jobs: heartbeat.active_jobs,
                    last_seen: received_at,
                    metadata: Default::default(),
                };
                let snapshot = entry.insert(presence).clone();
                warn!(runner_id = %snapshot.runner_id, "收到未注册Runner的心跳，自动注册");
                self.emit(PresenceEvent::Joined { presence: snapshot });
            }
        }
        Ok(())
    }

    /// 主动断开，立即标记为离线而不等待超时。返回Runner是否存在
    pub fn departed(&self, runner_id: &str) -> bool {
        let Some(mut presence) = self.runners.get_mut(runner_id) else {
            return false;
        };
        let now = Utc::now();
        presence.status = RunnerStatus::Offline;
        presence.active_jobs = 0;
        presence.last_seen = now;
        self.emit(PresenceEvent::Left {
            runner_id: runner_id.to_string(),
            at: now,
        });
        info!(runner_id, "Runner已断开");
        true
    }

    pub fn get(&self, runner_id: &str) -> Option<RunnerPresence> {
        self.runners
            .get(runner_id)
            .map(|presence| self.effective(presence.value(), Utc::now()))
    }

    pub fn snapshot(&self) -> HashMap<String, RunnerPresence> {
        self.snapshot_at(Utc::now())
    }

    /// 以 `now` 为基准的快照，心跳超时的Runner显示为 offline
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> HashMap<String, RunnerPresence> {
        self.runners
            .iter()
            .map(|entry| (entry.key().clone(), self.effective(entry.value(), now)))
            .collect()
    }

    fn effective(&self, presence: &RunnerPresence, now: DateTime<Utc>) -> RunnerPresence {
        let mut presence = presence.clone();
        if presence.is_expired(now, self.config.heartbeat_timeout_seconds) {
            presence.status = RunnerStatus::Offline;
        }
        presence
    }

    pub fn stats(&self) -> PresenceStats {
        let stats = compute_presence_stats(&self.snapshot());
        gauge!("coordinator_runners_online").set((stats.total - stats.offline) as f64);
        stats
    }

    /// 把心跳超时的Runner标记为离线，并移除离线超过清理阈值的记录
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();

        for mut entry in self.runners.iter_mut() {
            let presence = entry.value_mut();
            if presence.status != RunnerStatus::Offline
                && presence.is_expired(now, self.config.heartbeat_timeout_seconds)
            {
                warn!(
                    "检测到失联Runner: {} (上次心跳: {})",
                    presence.runner_id,
                    presence.last_seen.format("%Y-%m-%d %H:%M:%S UTC")
                );
                presence.status = RunnerStatus::Offline;
                presence.active_jobs = 0;
                outcome.demoted.push(presence.runner_id.clone());
                self.emit(PresenceEvent::Left {
                    runner_id: presence.runner_id.clone(),
                    at: now,
                });
            }
        }

        let threshold = self.config.offline_cleanup_threshold_seconds;
        self.runners.retain(|runner_id, presence| {
            let expired = presence.status == RunnerStatus::Offline
                && now - presence.last_seen > chrono::Duration::seconds(threshold);
            if expired {
                outcome.removed.push(runner_id.clone());
            }
            !expired
        });

        outcome
    }

    pub fn subscribe(&self) -> Subscription<PresenceEvent> {
        Subscription::new("presence", self.events.subscribe())
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

/// 后台巡检: 定期调用 [`PresenceRegistry::sweep`]
pub struct PresenceMonitor {
    registry: Arc<PresenceRegistry>,
    interval: Duration,
    running: Arc<tokio::sync::RwLock<bool>>,
}

impl PresenceMonitor {
    pub fn new(registry: Arc<PresenceRegistry>) -> Self {
        let interval = Duration::from_secs(registry.config().detection_interval_seconds);
        Self {
            registry,
            interval,
            running: Arc::new(tokio::sync::RwLock::new(false)),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn stop(&self) {
        info!("停止Runner在线状态巡检");
        *self.running.write().await = false;
    }

    /// 运行巡检循环，直到调用 `stop` 或收到停机信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!(interval = ?self.interval, "启动Runner在线状态巡检");
        *self.running.write().await = true;

        loop {
            if !*self.running.read().await {
                break;
            }

            let outcome = self.registry.sweep(Utc::now());
            if !outcome.demoted.is_empty() {
                info!("检测到 {} 个失联Runner", outcome.demoted.len());
            }
            if !outcome.removed.is_empty() {
                info!("清理了 {} 个离线Runner", outcome.removed.len());
            }
            let stats = self.registry.stats();
            debug!(total = stats.total, offline = stats.offline, "在线状态巡检完成");

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出在线状态巡检");
                    break;
                }
            }
        }

        *self.running.write().await = false;
    }
}
