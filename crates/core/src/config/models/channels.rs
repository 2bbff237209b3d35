use serde::{Deserialize, Serialize};

/// 任务分配流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub channel_capacity: usize,
    /// 订阅视图中每个状态桶保留的最大任务数
    pub max_jobs_per_status: usize,
    /// 重新同步时拉取的任务上限
    pub resync_limit: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            max_jobs_per_status: 50,
            resync_limit: 200,
        }
    }
}

impl FeedConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channel_capacity == 0 {
            return Err(anyhow::anyhow!("分配流通道容量必须大于0"));
        }

        if self.max_jobs_per_status == 0 {
            return Err(anyhow::anyhow!("每个状态的最大任务数必须大于0"));
        }

        if self.resync_limit < self.max_jobs_per_status {
            return Err(anyhow::anyhow!(
                "重新同步上限({})不能小于每个状态的最大任务数({})",
                self.resync_limit,
                self.max_jobs_per_status
            ));
        }

        Ok(())
    }
}

/// 临时广播通道配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub channel_capacity: usize,
    /// 订阅端日志环形缓冲区大小
    pub max_logs: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 4096,
            max_logs: 100,
        }
    }
}

impl BroadcastConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.channel_capacity == 0 {
            return Err(anyhow::anyhow!("广播通道容量必须大于0"));
        }

        if self.max_logs == 0 {
            return Err(anyhow::anyhow!("日志缓冲区大小必须大于0"));
        }

        Ok(())
    }
}
