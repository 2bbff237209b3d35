use serde::{Deserialize, Serialize};

/// 任务生命周期相关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub default_max_workers: i32,
    /// 一次提交最多拆分出的任务数
    pub max_jobs_per_submission: usize,
    pub max_metadata_entries: usize,
    pub max_metadata_key_len: usize,
    /// 任务租约时长，每次任务心跳续期
    pub lease_seconds: i64,
    /// 超过该时长未心跳的运行中任务被标记为疑似僵死
    pub stale_job_seconds: i64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            default_max_workers: 3,
            max_jobs_per_submission: 3,
            max_metadata_entries: 64,
            max_metadata_key_len: 64,
            lease_seconds: 300,
            stale_job_seconds: 600,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_max_workers <= 0 {
            return Err(anyhow::anyhow!("默认最大并发数必须大于0"));
        }

        if self.max_jobs_per_submission == 0 {
            return Err(anyhow::anyhow!("单次提交最大任务数必须大于0"));
        }

        if self.max_metadata_entries == 0 || self.max_metadata_key_len == 0 {
            return Err(anyhow::anyhow!("元数据限制必须大于0"));
        }

        if self.lease_seconds <= 0 {
            return Err(anyhow::anyhow!("任务租约时长必须大于0"));
        }

        if self.stale_job_seconds <= 0 {
            return Err(anyhow::anyhow!("僵死任务判定时长必须大于0"));
        }

        Ok(())
    }
}

/// Runner在线状态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub heartbeat_timeout_seconds: i64,
    pub detection_interval_seconds: u64,
    /// 离线多久后从注册表移除
    pub offline_cleanup_threshold_seconds: i64,
    pub event_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: 90,
            detection_interval_seconds: 30,
            offline_cleanup_threshold_seconds: 300,
            event_capacity: 256,
        }
    }
}

impl PresenceConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.heartbeat_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("心跳超时时间必须大于0"));
        }

        if self.detection_interval_seconds == 0 {
            return Err(anyhow::anyhow!("检测间隔必须大于0"));
        }

        if self.offline_cleanup_threshold_seconds < 0 {
            return Err(anyhow::anyhow!("离线清理阈值不能为负数"));
        }

        if self.event_capacity == 0 {
            return Err(anyhow::anyhow!("事件通道容量必须大于0"));
        }

        Ok(())
    }
}
