use serde::{Deserialize, Serialize};

use crate::logging::LogFormat;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub runner_id: String,
    pub runner_name: String,
    /// 为空表示接受任意抓取器
    pub scrapers: Vec<String>,
    pub heartbeat_interval_seconds: u64,
    pub poll_interval_seconds: u64,
    /// 同时执行的任务数上限
    pub max_concurrent_jobs: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            runner_id: "runner-001".to_string(),
            runner_name: "runner-001".to_string(),
            scrapers: Vec::new(),
            heartbeat_interval_seconds: 10,
            poll_interval_seconds: 5,
            max_concurrent_jobs: 1,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.runner_id.is_empty() {
            return Err(anyhow::anyhow!("Runner ID不能为空"));
        }

        if self.runner_name.is_empty() {
            return Err(anyhow::anyhow!("Runner名称不能为空"));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.poll_interval_seconds == 0 {
            return Err(anyhow::anyhow!("任务轮询间隔必须大于0"));
        }

        if self.max_concurrent_jobs == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub log_format: LogFormat,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            metrics_enabled: false,
            metrics_port: 9090,
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!(
                "无效的日志级别: {}，支持的级别: {:?}",
                self.log_level,
                valid_levels
            ));
        }

        if self.metrics_enabled && self.metrics_port == 0 {
            return Err(anyhow::anyhow!("指标端口必须大于0"));
        }

        Ok(())
    }
}
