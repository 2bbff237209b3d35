//! 日志初始化

use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ObservabilityConfig;
use crate::errors::CoordinatorError;
use crate::CoordinatorResult;

/// 日志输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = CoordinatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            "compact" => Ok(LogFormat::Compact),
            _ => Err(CoordinatorError::Configuration(format!(
                "无效的日志格式: {s}"
            ))),
        }
    }
}

/// 安装全局 tracing 订阅器，`RUST_LOG` 优先于配置中的日志级别
pub fn init_logging(config: &ObservabilityConfig) -> CoordinatorResult<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.log_format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .try_init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_target(true))
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .try_init(),
    };

    result.map_err(|e| CoordinatorError::Configuration(format!("日志初始化失败: {e}")))?;

    info!(
        logging.format = ?config.log_format,
        logging.level = %config.log_level,
        "日志系统已初始化"
    );

    Ok(())
}
