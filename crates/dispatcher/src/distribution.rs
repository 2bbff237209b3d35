//! 分布统计与看板视图
//!
//! 纯读侧聚合: 输入为在线状态快照、任务列表和广播视图，输出可随时确定性地重新计算。

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use coordinator_core::models::{Job, JobStatus, RunnerPresence, RunnerStatus};

use crate::broadcast_view::BroadcastView;

/// 各状态任务数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl JobCounts {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut counts = JobCounts::default();
        for job in jobs {
            counts.record(job.status);
        }
        counts
    }

    pub fn record(&mut self, status: JobStatus) {
        self.total += 1;
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn get(&self, status: JobStatus) -> usize {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Running => self.running,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Cancelled => self.cancelled,
        }
    }

    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.cancelled
    }

    /// 成功率 = completed / (completed + failed + cancelled)，四舍五入为百分比；分母为0时返回0
    pub fn success_rate(&self) -> u8 {
        let finished = self.finished();
        if finished == 0 {
            return 0;
        }
        ((self.completed as f64 / finished as f64) * 100.0).round() as u8
    }
}

/// 系统级分布统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionStats {
    pub counts: JobCounts,
    pub total_skus: usize,
    /// 保留一位小数
    pub avg_skus_per_job: f64,
    /// 出现过的不同 runner_id 数量
    pub unique_runners: usize,
    pub success_rate: u8,
    /// 已完成任务的吞吐量（SKU/分钟）
    pub items_per_minute: f64,
}

pub fn compute_distribution(jobs: &[Job]) -> DistributionStats {
    let counts = JobCounts::from_jobs(jobs);
    let total_skus: usize = jobs.iter().map(|job| job.skus.len()).sum();
    let avg_skus_per_job = if counts.total > 0 {
        (total_skus as f64 / counts.total as f64 * 10.0).round() / 10.0
    } else {
        0.0
    };
    let unique_runners = jobs
        .iter()
        .filter_map(|job| job.runner_id.as_deref())
        .collect::<HashSet<_>>()
        .len();

    DistributionStats {
        counts,
        total_skus,
        avg_skus_per_job,
        unique_runners,
        success_rate: counts.success_rate(),
        items_per_minute: items_per_minute(jobs),
    }
}

/// Σ skus / Σ (completed_at - created_at)，只统计 completed 的任务
pub fn items_per_minute(jobs: &[Job]) -> f64 {
    let (items, millis) = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Completed)
        .filter_map(|job| job.duration_ms().map(|ms| (job.skus.len(), ms.max(0))))
        .fold((0usize, 0i64), |(items, millis), (n, ms)| (items + n, millis + ms));

    if millis <= 0 {
        return 0.0;
    }
    let minutes = millis as f64 / 60_000.0;
    (items as f64 / minutes * 10.0).round() / 10.0
}

/// 每个Runner当前持有的 running 任务数
pub fn runner_loads(jobs: &[Job]) -> HashMap<String, usize> {
    let mut loads = HashMap::new();
    for job in jobs.iter().filter(|job| job.status == JobStatus::Running) {
        if let Some(runner_id) = &job.runner_id {
            *loads.entry(runner_id.clone()).or_insert(0) += 1;
        }
    }
    loads
}

/// 在线状态统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PresenceStats {
    pub total: usize,
    pub online: usize,
    pub busy: usize,
    pub idle: usize,
    pub offline: usize,
    pub total_active_jobs: u64,
    pub avg_jobs_per_busy_runner: f64,
    /// (online + busy) / total，百分比
    pub utilization_percent: f64,
}

pub fn compute_presence_stats(snapshot: &HashMap<String, RunnerPresence>) -> PresenceStats {
    let mut stats = PresenceStats {
        total: snapshot.len(),
        ..PresenceStats::default()
    };
    for presence in snapshot.values() {
        match presence.status {
            RunnerStatus::Online => stats.online += 1,
            RunnerStatus::Busy => stats.busy += 1,
            RunnerStatus::Idle => stats.idle += 1,
            RunnerStatus::Offline => stats.offline += 1,
        }
        if presence.is_active() {
            stats.total_active_jobs += presence.active_jobs as u64;
        }
    }

    if stats.busy > 0 {
        let busy_jobs: u64 = snapshot
            .values()
            .filter(|p| p.status == RunnerStatus::Busy)
            .map(|p| p.active_jobs as u64)
            .sum();
        stats.avg_jobs_per_busy_runner = (busy_jobs as f64 / stats.busy as f64 * 10.0).round() / 10.0;
    }
    if stats.total > 0 {
        stats.utilization_percent =
            ((stats.online + stats.busy) as f64 / stats.total as f64 * 100.0).round();
    }
    stats
}

/// 热力图中的一个单元: Runner正在执行的任务
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapCell {
    pub job_id: String,
    pub scrapers: Vec<String>,
    pub skus: usize,
    pub progress: Option<u8>,
}

/// 热力图的一行
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeatmapRow {
    pub runner_id: String,
    pub runner_name: String,
    pub status: RunnerStatus,
    pub running_jobs: usize,
    /// 最多 `max_jobs_per_runner` 个
    pub jobs: Vec<HeatmapCell>,
}

#[derive(Debug, Clone, Copy)]
pub struct HeatmapLimits {
    pub max_runners: usize,
    pub max_jobs_per_runner: usize,
}

impl Default for HeatmapLimits {
    fn default() -> Self {
        Self {
            max_runners: 20,
            max_jobs_per_runner: 10,
        }
    }
}

/// Runner × 任务热力图
///
/// 持有 running 任务但不在在线列表中的Runner以 offline 占位行出现。
/// 排序: online, busy, idle, offline，同级按名称。
pub fn build_heatmap(
    presence: &HashMap<String, RunnerPresence>,
    jobs: &[Job],
    broadcast: Option<&BroadcastView>,
    limits: HeatmapLimits,
) -> Vec<HeatmapRow> {
    let mut running: HashMap<&str, Vec<&Job>> = HashMap::new();
    for job in jobs.iter().filter(|job| job.status == JobStatus::Running) {
        if let Some(runner_id) = job.runner_id.as_deref() {
            running.entry(runner_id).or_default().push(job);
        }
    }

    let mut rows: Vec<HeatmapRow> = presence
        .values()
        .filter(|p| p.is_active() || running.contains_key(p.runner_id.as_str()))
        .map(|p| (p.runner_id.clone(), p.runner_name.clone(), p.status))
        .chain(
            running
                .keys()
                .filter(|runner_id| !presence.contains_key(**runner_id))
                .map(|runner_id| (runner_id.to_string(), runner_id.to_string(), RunnerStatus::Offline)),
        )
        .map(|(runner_id, runner_name, status)| {
            let mut owned = running.get(runner_id.as_str()).cloned().unwrap_or_default();
            owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let running_jobs = owned.len();
            let jobs = owned
                .into_iter()
                .take(limits.max_jobs_per_runner)
                .map(|job| HeatmapCell {
                    job_id: job.id.clone(),
                    scrapers: job.scrapers.clone(),
                    skus: job.skus.len(),
                    progress: broadcast
                        .and_then(|view| view.progress(&job.id))
                        .map(|p| p.progress),
                })
                .collect();
            HeatmapRow {
                runner_id,
                runner_name,
                status,
                running_jobs,
                jobs,
            }
        })
        .collect();

    rows.sort_by(|a, b| {
        a.status
            .display_rank()
            .cmp(&b.status.display_rank())
            .then_with(|| a.runner_name.cmp(&b.runner_name))
    });
    rows.truncate(limits.max_runners);
    rows
}

/// 疑似僵死的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    LeaseExpired,
    HeartbeatTimeout,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaleJob {
    pub job_id: String,
    pub runner_id: Option<String>,
    pub reason: StaleReason,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// 标记疑似僵死的 running 任务，只报告不做状态转换
pub fn detect_stale_jobs(jobs: &[Job], now: DateTime<Utc>, stale_after_seconds: i64) -> Vec<StaleJob> {
    let stale_after = Duration::seconds(stale_after_seconds);
    jobs.iter()
        .filter(|job| job.status == JobStatus::Running)
        .filter_map(|job| {
            let last_heartbeat = job.heartbeat_at.or(job.started_at);
            let reason = if job.lease_expires_at.is_some_and(|lease| lease < now) {
                StaleReason::LeaseExpired
            } else if last_heartbeat
                .or(Some(job.created_at))
                .is_some_and(|at| now - at > stale_after)
            {
                StaleReason::HeartbeatTimeout
            } else {
                return None;
            };
            Some(StaleJob {
                job_id: job.id.clone(),
                runner_id: job.runner_id.clone(),
                reason,
                last_heartbeat,
            })
        })
        .collect()
}

/// 合并在线状态、任务分配流和广播通道得到的看板快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistributionSnapshot {
    pub stats: DistributionStats,
    pub presence: PresenceStats,
    pub runner_loads: HashMap<String, usize>,
    pub heatmap: Vec<HeatmapRow>,
    pub stale_jobs: Vec<StaleJob>,
    pub generated_at: DateTime<Utc>,
}

impl DistributionSnapshot {
    pub fn build(
        presence: &HashMap<String, RunnerPresence>,
        jobs: &[Job],
        broadcast: Option<&BroadcastView>,
        limits: HeatmapLimits,
        stale_after_seconds: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            stats: compute_distribution(jobs),
            presence: compute_presence_stats(presence),
            runner_loads: runner_loads(jobs),
            heatmap: build_heatmap(presence, jobs, broadcast, limits),
            stale_jobs: detect_stale_jobs(jobs, now, stale_after_seconds),
            generated_at: now,
        }
    }
}
