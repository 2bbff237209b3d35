use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{CoordinatorError, CoordinatorResult};

/// 抓取日志级别
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScrapeLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for ScrapeLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScrapeLogLevel::Debug => "DEBUG",
            ScrapeLogLevel::Info => "INFO",
            ScrapeLogLevel::Warn => "WARN",
            ScrapeLogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Runner广播的单行日志，不落库
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapeJobLog {
    pub id: String,
    pub job_id: String,
    pub runner_id: String,
    pub level: ScrapeLogLevel,
    pub message: String,
    pub source: Option<String>,
    pub sku: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ScrapeJobLog {
    pub fn new(
        job_id: impl Into<String>,
        runner_id: impl Into<String>,
        level: ScrapeLogLevel,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.into(),
            runner_id: runner_id.into(),
            level,
            message: message.into(),
            source: None,
            sku: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
        self.sku = Some(sku.into());
        self
    }
}

/// 执行阶段
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Initializing,
    Scraping,
    Processing,
    Uploading,
    Complete,
}

/// 进度样本，按任务ID只保留最新值
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobProgress {
    pub job_id: String,
    pub runner_id: String,
    pub progress: u8,
    pub phase: JobPhase,
    pub current_sku: Option<String>,
    pub items_processed: Option<u32>,
    pub items_total: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl JobProgress {
    pub fn new(
        job_id: impl Into<String>,
        runner_id: impl Into<String>,
        progress: u8,
        phase: JobPhase,
    ) -> CoordinatorResult<Self> {
        if progress > 100 {
            return Err(CoordinatorError::validation(format!(
                "进度必须在0-100之间: {progress}"
            )));
        }
        Ok(Self {
            job_id: job_id.into(),
            runner_id: runner_id.into(),
            progress,
            phase,
            current_sku: None,
            items_processed: None,
            items_total: None,
            timestamp: Utc::now(),
        })
    }

    /// 按已处理/总数计算百分比
    pub fn from_counts(
        job_id: impl Into<String>,
        runner_id: impl Into<String>,
        processed: u32,
        total: u32,
        phase: JobPhase,
    ) -> Self {
        let progress = if total == 0 {
            0
        } else {
            ((processed.min(total) as u64 * 100) / total as u64) as u8
        };
        Self {
            job_id: job_id.into(),
            runner_id: runner_id.into(),
            progress,
            phase,
            current_sku: None,
            items_processed: Some(processed),
            items_total: Some(total),
            timestamp: Utc::now(),
        }
    }
}

/// 任务认领通知
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobAssignedNotice {
    pub job_id: String,
    pub runner_id: String,
    pub runner_name: String,
    pub scrapers: Vec<String>,
    pub skus_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// Runner生命周期状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunnerLifecycle {
    Online,
    Offline,
    Error,
    Shutdown,
}

/// Runner状态变更通知
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerStatusNotice {
    pub runner_id: String,
    pub runner_name: String,
    pub status: RunnerLifecycle,
    pub reason: Option<String>,
    pub jobs_processed: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// 选择器/字段抽取结果的种类
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    Selector,
    Extraction,
}

/// 单次选择器匹配或字段抽取的结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapeOutcome {
    pub job_id: String,
    pub runner_id: String,
    pub sku: String,
    pub kind: OutcomeKind,
    pub name: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

/// 广播通道上的事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum BroadcastEvent {
    RunnerLog(ScrapeJobLog),
    JobProgress(JobProgress),
    JobAssigned(JobAssignedNotice),
    RunnerStatus(RunnerStatusNotice),
    Outcome(ScrapeOutcome),
}

impl BroadcastEvent {
    pub fn job_id(&self) -> Option<&str> {
        match self {
            BroadcastEvent::RunnerLog(log) => Some(&log.job_id),
            BroadcastEvent::JobProgress(progress) => Some(&progress.job_id),
            BroadcastEvent::JobAssigned(notice) => Some(&notice.job_id),
            BroadcastEvent::RunnerStatus(_) => None,
            BroadcastEvent::Outcome(outcome) => Some(&outcome.job_id),
        }
    }

    pub fn runner_id(&self) -> &str {
        match self {
            BroadcastEvent::RunnerLog(log) => &log.runner_id,
            BroadcastEvent::JobProgress(progress) => &progress.runner_id,
            BroadcastEvent::JobAssigned(notice) => &notice.runner_id,
            BroadcastEvent::RunnerStatus(notice) => &notice.runner_id,
            BroadcastEvent::Outcome(outcome) => &outcome.runner_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            BroadcastEvent::RunnerLog(_) => "runner_log",
            BroadcastEvent::JobProgress(_) => "job_progress",
            BroadcastEvent::JobAssigned(_) => "job_assigned",
            BroadcastEvent::RunnerStatus(_) => "runner_status",
            BroadcastEvent::Outcome(_) => "outcome",
        }
    }
}

/// 订阅端过滤条件，通道本身不做过滤
#[derive(Debug, Clone, Default)]
pub struct BroadcastFilter {
    pub job_ids: Option<HashSet<String>>,
    pub runner_ids: Option<HashSet<String>>,
    /// 仅作用于日志事件
    pub min_level: Option<ScrapeLogLevel>,
}

impl BroadcastFilter {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_ids: Some(HashSet::from([job_id.into()])),
            ..Self::default()
        }
    }

    pub fn matches(&self, event: &BroadcastEvent) -> bool {
        if let Some(job_ids) = &self.job_ids {
            match event.job_id() {
                Some(job_id) if job_ids.contains(job_id) => {}
                _ => return false,
            }
        }
        if let Some(runner_ids) = &self.runner_ids {
            if !runner_ids.contains(event.runner_id()) {
                return false;
            }
        }
        if let (Some(min_level), BroadcastEvent::RunnerLog(log)) = (self.min_level, event) {
            if log.level < min_level {
                return false;
            }
        }
        true
    }
}

/// 成功/总数计数，用于计算健康分
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthTally {
    pub successes: u64,
    pub total: u64,
}

impl HealthTally {
    pub fn record(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.successes += 1;
        }
    }
}

/// 健康等级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthClass {
    Healthy,
    Degraded,
    Broken,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_rejects_out_of_range() {
        assert!(JobProgress::new("job-1", "r1", 101, JobPhase::Scraping).is_err());
        assert!(JobProgress::new("job-1", "r1", 100, JobPhase::Complete).is_ok());
    }

    #[test]
    fn test_progress_from_counts() {
        let progress = JobProgress::from_counts("job-1", "r1", 1, 3, JobPhase::Scraping);
        assert_eq!(progress.progress, 33);
        let progress = JobProgress::from_counts("job-1", "r1", 0, 0, JobPhase::Initializing);
        assert_eq!(progress.progress, 0);
    }

    #[test]
    fn test_filter_by_level_only_applies_to_logs() {
        let filter = BroadcastFilter {
            min_level: Some(ScrapeLogLevel::Warn),
            ..BroadcastFilter::default()
        };
        let debug = BroadcastEvent::RunnerLog(ScrapeJobLog::new(
            "job-1",
            "r1",
            ScrapeLogLevel::Debug,
            "noise",
        ));
        let error = BroadcastEvent::RunnerLog(ScrapeJobLog::new(
            "job-1",
            "r1",
            ScrapeLogLevel::Error,
            "boom",
        ));
        let progress = BroadcastEvent::JobProgress(
            JobProgress::new("job-1", "r1", 10, JobPhase::Scraping).unwrap(),
        );
        assert!(!filter.matches(&debug));
        assert!(filter.matches(&error));
        assert!(filter.matches(&progress));
    }

    #[test]
    fn test_filter_by_job_and_runner() {
        let filter = BroadcastFilter {
            job_ids: Some(HashSet::from(["job-1".to_string()])),
            runner_ids: Some(HashSet::from(["r1".to_string()])),
            min_level: None,
        };
        let matching = BroadcastEvent::RunnerLog(ScrapeJobLog::new(
            "job-1",
            "r1",
            ScrapeLogLevel::Info,
            "ok",
        ));
        let other_job = BroadcastEvent::RunnerLog(ScrapeJobLog::new(
            "job-2",
            "r1",
            ScrapeLogLevel::Info,
            "ok",
        ));
        let other_runner = BroadcastEvent::RunnerLog(ScrapeJobLog::new(
            "job-1",
            "r2",
            ScrapeLogLevel::Info,
            "ok",
        ));
        assert!(filter.matches(&matching));
        assert!(!filter.matches(&other_job));
        assert!(!filter.matches(&other_runner));
    }

    #[test]
    fn test_event_wire_format() {
        let event = BroadcastEvent::JobProgress(
            JobProgress::new("job-1", "r1", 42, JobPhase::Scraping).unwrap(),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "job_progress");
        assert_eq!(value["payload"]["progress"], 42);
        assert_eq!(value["payload"]["phase"], "scraping");
    }
}
