//! 广播通道的订阅端视图
//!
//! 进度按任务ID只保留最新值；日志保存在有上限的环形缓冲区中，超出时淘汰最旧的。
//! 选择器/提取结果只累计成功数与总数，不保留历史。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use coordinator_core::{
    models::{
        BroadcastEvent, BroadcastFilter, HealthClass, HealthTally, JobAssignedNotice, JobProgress,
        RunnerStatusNotice, ScrapeJobLog,
    },
    traits::BroadcastPublisher,
    CoordinatorError,
};

use crate::lifecycle::{compute_job_health, health_class};

pub const DEFAULT_MAX_LOGS: usize = 100;

#[derive(Debug, Clone)]
pub struct BroadcastView {
    filter: BroadcastFilter,
    max_logs: usize,
    logs: VecDeque<ScrapeJobLog>,
    progress: HashMap<String, JobProgress>,
    tallies: HashMap<String, HealthTally>,
    assignments: HashMap<String, JobAssignedNotice>,
    runner_statuses: HashMap<String, RunnerStatusNotice>,
}

impl Default for BroadcastView {
    fn default() -> Self {
        Self::new(BroadcastFilter::default(), DEFAULT_MAX_LOGS)
    }
}

impl BroadcastView {
    pub fn new(filter: BroadcastFilter, max_logs: usize) -> Self {
        Self {
            filter,
            max_logs: max_logs.max(1),
            logs: VecDeque::new(),
            progress: HashMap::new(),
            tallies: HashMap::new(),
            assignments: HashMap::new(),
            runner_statuses: HashMap::new(),
        }
    }

    /// 应用一条事件，不匹配过滤条件时返回 `false`
    pub fn apply(&mut self, event: &BroadcastEvent) -> bool {
        if !self.filter.matches(event) {
            return false;
        }

        match event {
            BroadcastEvent::RunnerLog(log) => {
                if self.logs.len() == self.max_logs {
                    self.logs.pop_front();
                }
                self.logs.push_back(log.clone());
            }
            BroadcastEvent::JobProgress(progress) => {
                self.progress.insert(progress.job_id.clone(), progress.clone());
            }
            BroadcastEvent::JobAssigned(notice) => {
                self.assignments.insert(notice.job_id.clone(), notice.clone());
            }
            BroadcastEvent::RunnerStatus(notice) => {
                self.runner_statuses
                    .insert(notice.runner_id.clone(), notice.clone());
            }
            BroadcastEvent::Outcome(outcome) => {
                self.tallies
                    .entry(outcome.job_id.clone())
                    .or_default()
                    .record(outcome.success);
            }
        }
        true
    }

    /// 日志，按到达顺序从旧到新
    pub fn logs(&self) -> impl Iterator<Item = &ScrapeJobLog> {
        self.logs.iter()
    }

    pub fn logs_for_job<'a>(&'a self, job_id: &'a str) -> impl Iterator<Item = &'a ScrapeJobLog> {
        self.logs.iter().filter(move |log| log.job_id == job_id)
    }

    pub fn log_count(&self) -> usize {
        self.logs.len()
    }

    pub fn clear_logs(&mut self) {
        self.logs.clear();
    }

    pub fn progress(&self, job_id: &str) -> Option<&JobProgress> {
        self.progress.get(job_id)
    }

    pub fn assignment(&self, job_id: &str) -> Option<&JobAssignedNotice> {
        self.assignments.get(job_id)
    }

    pub fn runner_status(&self, runner_id: &str) -> Option<&RunnerStatusNotice> {
        self.runner_statuses.get(runner_id)
    }

    pub fn tally(&self, job_id: &str) -> HealthTally {
        self.tallies.get(job_id).copied().unwrap_or_default()
    }

    /// 0-100 的健康分，没有结果事件时为0
    pub fn job_health(&self, job_id: &str) -> u8 {
        compute_job_health(&self.tally(job_id))
    }

    pub fn health_class(&self, job_id: &str) -> HealthClass {
        health_class(&self.tally(job_id))
    }

    pub fn filter(&self) -> &BroadcastFilter {
        &self.filter
    }
}

/// 把广播通道持续合并进 [`BroadcastView`] 的后台订阅者
pub struct BroadcastSubscriber {
    publisher: Arc<dyn BroadcastPublisher>,
    view: Arc<RwLock<BroadcastView>>,
}

impl BroadcastSubscriber {
    pub fn new(publisher: Arc<dyn BroadcastPublisher>, filter: BroadcastFilter, max_logs: usize) -> Self {
        Self {
            publisher,
            view: Arc::new(RwLock::new(BroadcastView::new(filter, max_logs))),
        }
    }

    pub fn view(&self) -> Arc<RwLock<BroadcastView>> {
        self.view.clone()
    }

    pub async fn snapshot(&self) -> BroadcastView {
        self.view.read().await.clone()
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut subscription = self.publisher.subscribe();
        info!("广播订阅已启动");

        loop {
            tokio::select! {
                received = subscription.recv() => match received {
                    Ok(event) => {
                        self.view.write().await.apply(&event);
                    }
                    Err(CoordinatorError::ChannelDisconnected(reason)) if subscription.is_closed() => {
                        warn!(reason = %reason, "广播通道已关闭");
                        break;
                    }
                    // 广播数据不可重放，丢失的遥测直接跳过
                    Err(e) => {
                        warn!("广播订阅落后: {}", e);
                    }
                },
                _ = shutdown.recv() => {
                    info!("收到停止信号，广播订阅退出");
                    break;
                }
            }
        }
    }
}
