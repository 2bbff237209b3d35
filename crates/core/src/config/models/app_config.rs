use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    channels::{BroadcastConfig, FeedConfig},
    coordinator::{CoordinatorConfig, PresenceConfig},
    database::DatabaseConfig,
    runner_observability::{ObservabilityConfig, RunnerConfig},
};

/// 系统配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub coordinator: CoordinatorConfig,
    pub presence: PresenceConfig,
    pub feed: FeedConfig,
    pub broadcast: BroadcastConfig,
    pub runner: RunnerConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 未指定路径时依次尝试默认位置，都不存在则使用内置默认值。
    /// 环境变量优先级最高，例如 `COORDINATOR_PRESENCE__HEARTBEAT_TIMEOUT_SECONDS=30`。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/coordinator.toml", "coordinator.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("COORDINATOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.coordinator
            .validate()
            .context("协调器配置验证失败")?;
        self.presence.validate().context("在线状态配置验证失败")?;
        self.feed.validate().context("分配流配置验证失败")?;
        self.broadcast.validate().context("广播配置验证失败")?;
        self.runner.validate().context("Runner配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}
