use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use coordinator_core::{
    models::{Job, JobPhase, JobStatus, OutcomeKind, ScrapeLogLevel},
    CoordinatorResult,
};

use crate::components::ProgressReporter;

/// 一次任务执行的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub items_processed: u32,
}

impl ExecutionOutcome {
    pub fn completed(items_processed: u32) -> Self {
        Self {
            status: JobStatus::Completed,
            error_message: None,
            items_processed,
        }
    }

    pub fn failed(message: impl Into<String>, items_processed: u32) -> Self {
        Self {
            status: JobStatus::Failed,
            error_message: Some(message.into()),
            items_processed,
        }
    }
}

/// 任务执行器接口。抓取逻辑本身对协调核心不透明
#[async_trait]
pub trait JobExecutor: Send + Sync {
    fn name(&self) -> &str;

    /// 执行任务。返回 `Err` 时任务按失败上报
    async fn execute(&self, job: &Job, reporter: &ProgressReporter) -> CoordinatorResult<ExecutionOutcome>;
}

/// 模拟抓取的执行器，用于本地演示和测试
pub struct SimulatedExecutor {
    per_sku_delay: Duration,
    failure_rate: f64,
}

impl SimulatedExecutor {
    pub fn new(per_sku_delay: Duration, failure_rate: f64) -> Self {
        Self {
            per_sku_delay,
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }
}

impl Default for SimulatedExecutor {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), 0.05)
    }
}

#[async_trait]
impl JobExecutor for SimulatedExecutor {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn execute(&self, job: &Job, reporter: &ProgressReporter) -> CoordinatorResult<ExecutionOutcome> {
        let total = job.skus.len() as u32;
        reporter.progress(0, total, JobPhase::Initializing);

        let mut failures = 0u32;
        for (index, sku) in job.skus.iter().enumerate() {
            tokio::time::sleep(self.per_sku_delay).await;

            for scraper in &job.scrapers {
                let success = !rand::rng().random_bool(self.failure_rate);
                reporter.outcome(sku, OutcomeKind::Extraction, scraper, success);
                if success {
                    reporter.log_sku(ScrapeLogLevel::Debug, sku, format!("{scraper} 抓取完成"));
                } else {
                    failures += 1;
                    reporter.log_sku(ScrapeLogLevel::Warn, sku, format!("{scraper} 未能提取数据"));
                }
            }
            reporter.progress(index as u32 + 1, total, JobPhase::Scraping);
        }

        reporter.progress(total, total, JobPhase::Complete);
        let attempts = total * job.scrapers.len() as u32;
        if attempts > 0 && failures == attempts {
            return Ok(ExecutionOutcome::failed("所有SKU抓取失败", total));
        }
        Ok(ExecutionOutcome::completed(total))
    }
}
