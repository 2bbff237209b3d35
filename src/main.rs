use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use coordinator::app::Application;
use coordinator::shutdown::{wait_for_shutdown_signal, ShutdownManager};
use coordinator_core::{config::ObservabilityConfig, init_logging, AppConfig, LogFormat};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // 解析命令行参数
    let matches = Command::new("coordinator")
        .version(env!("CARGO_PKG_VERSION"))
        .about("抓取任务分发与Runner协调系统")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("配置文件路径，缺省时查找 config/coordinator.toml"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .help("日志级别，覆盖配置文件")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .help("日志格式，覆盖配置文件")
                .value_parser(["json", "pretty", "compact"]),
        )
        .arg(
            Arg::new("demo-runners")
                .long("demo-runners")
                .value_name("N")
                .help("在进程内启动的演示Runner数量")
                .value_parser(clap::value_parser!(usize))
                .default_value("0"),
        )
        .get_matches();

    let config_path = matches.get_one::<String>("config");
    let demo_runners = matches.get_one::<usize>("demo-runners").copied().unwrap_or(0);

    // 加载配置
    let mut config = AppConfig::load(config_path.map(String::as_str))
        .with_context(|| format!("加载配置失败: {config_path:?}"))?;

    if let Some(level) = matches.get_one::<String>("log-level") {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = matches.get_one::<String>("log-format") {
        config.observability.log_format = format.parse::<LogFormat>()?;
    }

    // 初始化日志系统
    init_logging(&config.observability)?;
    init_metrics(&config.observability)?;

    info!("启动抓取任务协调系统");
    if let Some(path) = config_path {
        info!("配置文件: {path}");
    }

    // 创建应用实例
    let app = Arc::new(Application::new(config, demo_runners).await?);

    // 创建优雅关闭管理器
    let shutdown_manager = ShutdownManager::new();

    let app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);

        tokio::spawn(async move {
            if let Err(e) = app.run(shutdown_rx).await {
                error!("应用运行失败: {e}");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("收到关闭信号，开始优雅关闭...");
    shutdown_manager.shutdown().await;

    // 等待应用关闭，设置超时
    match tokio::time::timeout(Duration::from_secs(30), app_handle).await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => error!("应用关闭时发生错误: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    info!("抓取任务协调系统已退出");
    Ok(())
}

/// 安装 Prometheus 指标导出器
fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus指标导出器失败: {}", e))?;

    info!(port = config.metrics_port, "Prometheus指标导出器已启动");
    Ok(())
}
