use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{CoordinatorError, CoordinatorResult};

/// 任务与分片共用的状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// 终态一旦到达便不可再变更
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// 状态机允许的转换: pending -> running -> {completed|failed|cancelled}，
    /// 另外允许未被认领的任务直接取消
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Pending, JobStatus::Cancelled) => true,
            (JobStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(CoordinatorError::Serialization(format!(
                "Invalid job status: {s}"
            ))),
        }
    }
}

/// 元数据取值，只允许基础类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetadataValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        MetadataValue::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        MetadataValue::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        MetadataValue::Int(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        MetadataValue::Bool(value)
    }
}

/// 开放式元数据（priority、config_id、test_run_id 等由运维方自定义）
pub type Metadata = BTreeMap<String, MetadataValue>;

/// 校验元数据的条目数和键长度
pub fn validate_metadata(
    metadata: &Metadata,
    max_entries: usize,
    max_key_len: usize,
) -> CoordinatorResult<()> {
    if metadata.len() > max_entries {
        return Err(CoordinatorError::validation(format!(
            "元数据条目过多: {} > {}",
            metadata.len(),
            max_entries
        )));
    }
    for key in metadata.keys() {
        if key.is_empty() || key.len() > max_key_len {
            return Err(CoordinatorError::validation(format!(
                "元数据键长度无效: '{key}'"
            )));
        }
    }
    Ok(())
}

/// 抓取任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub skus: Vec<String>,
    pub scrapers: Vec<String>,
    pub test_mode: bool,
    pub max_workers: i32,
    pub status: JobStatus,
    pub runner_id: Option<String>,
    pub metadata: Metadata,
    /// 每次持久化变更递增，用于订阅端去重和保序
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    pub fn new(
        id: String,
        skus: Vec<String>,
        scrapers: Vec<String>,
        test_mode: bool,
        max_workers: i32,
        metadata: Metadata,
    ) -> Self {
        Self {
            id,
            skus,
            scrapers,
            test_mode,
            max_workers,
            status: JobStatus::Pending,
            runner_id: None,
            metadata,
            version: 1,
            created_at: Utc::now(),
            started_at: None,
            heartbeat_at: None,
            lease_expires_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_owned_by(&self, runner_id: &str) -> bool {
        self.runner_id.as_deref() == Some(runner_id)
    }

    pub fn test_run_id(&self) -> Option<&str> {
        self.metadata.get("test_run_id").and_then(|v| v.as_str())
    }

    pub fn config_id(&self) -> Option<&str> {
        self.metadata.get("config_id").and_then(|v| v.as_str())
    }

    pub fn priority(&self) -> i64 {
        self.metadata
            .get("priority")
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    /// 运行时长（毫秒），仅对已完成的任务有意义
    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|completed| (completed - self.created_at).num_milliseconds())
    }
}

/// 任务分片
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobChunk {
    pub job_id: String,
    pub chunk_index: i32,
    pub skus: Vec<String>,
    pub scrapers: Vec<String>,
    pub status: JobStatus,
}

impl JobChunk {
    /// 按连续切片划分SKU；`chunk_size` 为空时只生成一个覆盖全部SKU的分片
    pub fn partition(
        job_id: &str,
        skus: &[String],
        scrapers: &[String],
        chunk_size: Option<usize>,
    ) -> Vec<JobChunk> {
        let size = match chunk_size {
            Some(size) if size > 0 => size,
            _ => skus.len().max(1),
        };

        skus.chunks(size)
            .enumerate()
            .map(|(index, slice)| JobChunk {
                job_id: job_id.to_string(),
                chunk_index: index as i32,
                skus: slice.to_vec(),
                scrapers: scrapers.to_vec(),
                status: JobStatus::Pending,
            })
            .collect()
    }
}

/// 条件更新的前置条件: "WHERE status = $expected [AND runner_id = $owner]"
#[derive(Debug, Clone, PartialEq)]
pub struct JobGuard {
    pub status: JobStatus,
    pub owner: Option<String>,
}

impl JobGuard {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status,
            owner: None,
        }
    }

    pub fn owned(status: JobStatus, runner_id: impl Into<String>) -> Self {
        Self {
            status,
            owner: Some(runner_id.into()),
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if job.status != self.status {
            return false;
        }
        match &self.owner {
            Some(owner) => job.runner_id.as_deref() == Some(owner.as_str()),
            None => true,
        }
    }
}

/// 条件更新时写入的字段
#[derive(Debug, Clone, PartialEq)]
pub enum JobUpdate {
    Claim {
        runner_id: String,
        at: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    },
    Heartbeat {
        at: DateTime<Utc>,
        lease_expires_at: DateTime<Utc>,
    },
    Finish {
        status: JobStatus,
        error_message: Option<String>,
        at: DateTime<Utc>,
    },
}

impl JobUpdate {
    /// 更新后的目标状态
    pub fn target_status(&self, current: JobStatus) -> JobStatus {
        match self {
            JobUpdate::Claim { .. } => JobStatus::Running,
            JobUpdate::Heartbeat { .. } => current,
            JobUpdate::Finish { status, .. } => *status,
        }
    }

    pub fn apply(&self, job: &mut Job) {
        match self {
            JobUpdate::Claim {
                runner_id,
                at,
                lease_expires_at,
            } => {
                job.status = JobStatus::Running;
                job.runner_id = Some(runner_id.clone());
                job.started_at = Some(*at);
                job.heartbeat_at = Some(*at);
                job.lease_expires_at = Some(*lease_expires_at);
            }
            JobUpdate::Heartbeat {
                at,
                lease_expires_at,
            } => {
                job.heartbeat_at = Some(*at);
                job.lease_expires_at = Some(*lease_expires_at);
            }
            JobUpdate::Finish {
                status,
                error_message,
                at,
            } => {
                job.status = *status;
                job.completed_at = Some(*at);
                job.error_message = error_message.clone();
                job.lease_expires_at = None;
            }
        }
        job.version += 1;
    }
}

/// 任务创建选项
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default)]
    pub test_mode: bool,
    pub max_workers: Option<i32>,
    #[serde(default)]
    pub metadata: Metadata,
    /// 每个分片的SKU数量，为空则整任务一个分片
    pub chunk_size: Option<usize>,
}

/// 外部提交接口的请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSubmission {
    pub skus: Vec<String>,
    pub scrapers: Vec<String>,
    pub test_mode: Option<bool>,
    pub max_workers: Option<i32>,
    pub metadata: Option<Metadata>,
    /// 最多拆分成多少个并行任务
    pub max_runners: Option<usize>,
}

impl JobSubmission {
    pub fn options(&self) -> JobOptions {
        JobOptions {
            test_mode: self.test_mode.unwrap_or(false),
            max_workers: self.max_workers,
            metadata: self.metadata.clone().unwrap_or_default(),
            chunk_size: None,
        }
    }
}

/// 提交结果
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionReceipt {
    pub job_ids: Vec<String>,
    pub status: JobStatus,
}

/// 任务列表查询条件
#[derive(Debug, Clone, Default)]
pub struct JobQuery {
    pub statuses: Option<Vec<JobStatus>>,
    pub scrapers: Option<Vec<String>>,
    pub runner_id: Option<String>,
    pub test_mode_only: bool,
    pub limit: Option<usize>,
    /// true: 按创建时间升序（认领用），false: 降序（看板用）
    pub oldest_first: bool,
}

impl JobQuery {
    pub fn pending_oldest_first() -> Self {
        Self {
            statuses: Some(vec![JobStatus::Pending]),
            oldest_first: true,
            ..Self::default()
        }
    }

    pub fn recent(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&job.status) {
                return false;
            }
        }
        if let Some(scrapers) = &self.scrapers {
            if !job.scrapers.iter().any(|s| scrapers.contains(s)) {
                return false;
            }
        }
        if let Some(runner_id) = &self.runner_id {
            if job.runner_id.as_deref() != Some(runner_id.as_str()) {
                return false;
            }
        }
        if self.test_mode_only && !job.test_mode {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skus(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_status_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
        for terminal in [JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled] {
            for next in JobStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_status_round_trip_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("unknown".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_single_chunk_partition_covers_all_skus() {
        let all = skus(&["A", "B", "C"]);
        let chunks = JobChunk::partition("job-1", &all, &skus(&["amazon"]), None);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].skus, all);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].status, JobStatus::Pending);
    }

    #[test]
    fn test_sized_partition_is_contiguous() {
        let all = skus(&["A", "B", "C", "D", "E"]);
        let chunks = JobChunk::partition("job-1", &all, &skus(&["amazon"]), Some(2));
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].chunk_index, 2);
        let flattened: Vec<String> = chunks.into_iter().flat_map(|c| c.skus).collect();
        assert_eq!(flattened, all);
    }

    #[test]
    fn test_guard_checks_owner() {
        let mut job = Job::new(
            "job-1".to_string(),
            skus(&["A"]),
            skus(&["amazon"]),
            false,
            3,
            Metadata::new(),
        );
        job.status = JobStatus::Running;
        job.runner_id = Some("r1".to_string());

        assert!(JobGuard::owned(JobStatus::Running, "r1").matches(&job));
        assert!(!JobGuard::owned(JobStatus::Running, "r2").matches(&job));
        assert!(JobGuard::status(JobStatus::Running).matches(&job));
        assert!(!JobGuard::status(JobStatus::Pending).matches(&job));
    }

    #[test]
    fn test_update_bumps_version() {
        let mut job = Job::new(
            "job-1".to_string(),
            skus(&["A"]),
            skus(&["amazon"]),
            false,
            3,
            Metadata::new(),
        );
        let now = Utc::now();
        JobUpdate::Claim {
            runner_id: "r1".to_string(),
            at: now,
            lease_expires_at: now,
        }
        .apply(&mut job);
        assert_eq!(job.version, 2);
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.is_owned_by("r1"));
    }

    #[test]
    fn test_metadata_helpers_and_validation() {
        let mut metadata = Metadata::new();
        metadata.insert("test_run_id".to_string(), "run-9".into());
        metadata.insert("priority".to_string(), 5i64.into());
        let job = Job::new(
            "job-1".to_string(),
            skus(&["A"]),
            skus(&["amazon"]),
            true,
            3,
            metadata.clone(),
        );
        assert_eq!(job.test_run_id(), Some("run-9"));
        assert_eq!(job.priority(), 5);
        assert!(validate_metadata(&metadata, 8, 32).is_ok());
        assert!(validate_metadata(&metadata, 1, 32).is_err());
    }

    #[test]
    fn test_metadata_deserializes_primitive_values() {
        let metadata: Metadata =
            serde_json::from_str(r#"{"a": 1, "b": "x", "c": true, "d": null, "e": 1.5}"#)
                .unwrap();
        assert_eq!(metadata["a"], MetadataValue::Int(1));
        assert_eq!(metadata["b"], MetadataValue::Text("x".to_string()));
        assert_eq!(metadata["c"], MetadataValue::Bool(true));
        assert_eq!(metadata["d"], MetadataValue::Null);
        assert_eq!(metadata["e"], MetadataValue::Float(1.5));
    }
}
