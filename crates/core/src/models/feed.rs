use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Job;

/// 存储层原始的行变更类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RowOperation {
    Insert,
    Update,
}

/// 存储层发出的行级变更通知（类似数据库的 NOTIFY）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RowChange {
    pub operation: RowOperation,
    pub job: Job,
    pub committed_at: DateTime<Utc>,
}

impl RowChange {
    pub fn insert(job: Job) -> Self {
        Self {
            operation: RowOperation::Insert,
            job,
            committed_at: Utc::now(),
        }
    }

    pub fn update(job: Job) -> Self {
        Self {
            operation: RowOperation::Update,
            job,
            committed_at: Utc::now(),
        }
    }
}

/// 规范化后的任务事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobEventType {
    Created,
    Updated,
}

/// 分配流投递给订阅者的任务视图: 任务字段 + 事件元信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobAssignment {
    pub event_type: JobEventType,
    pub job: Job,
    pub emitted_at: DateTime<Utc>,
}

impl JobAssignment {
    pub fn job_id(&self) -> &str {
        &self.job.id
    }
}

impl From<RowChange> for JobAssignment {
    fn from(change: RowChange) -> Self {
        let event_type = match change.operation {
            RowOperation::Insert => JobEventType::Created,
            RowOperation::Update => JobEventType::Updated,
        };
        Self {
            event_type,
            job: change.job,
            emitted_at: Utc::now(),
        }
    }
}

/// 订阅兴趣: 按抓取器名称、任务ID或测试模式过滤
#[derive(Debug, Clone, Default)]
pub struct FeedFilter {
    pub scrapers: Option<HashSet<String>>,
    pub job_ids: Option<HashSet<String>>,
    pub test_mode_only: bool,
}

impl FeedFilter {
    pub fn scrapers<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scrapers: Some(names.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn job_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            job_ids: Some(ids.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(job_ids) = &self.job_ids {
            if !job_ids.contains(&job.id) {
                return false;
            }
        }
        if let Some(scrapers) = &self.scrapers {
            if !job.scrapers.iter().any(|s| scrapers.contains(s)) {
                return false;
            }
        }
        if self.test_mode_only && !job.test_mode {
            return false;
        }
        true
    }
}
