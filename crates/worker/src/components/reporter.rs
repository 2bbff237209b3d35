use std::sync::Arc;

use chrono::Utc;

use coordinator_core::{
    models::{
        BroadcastEvent, JobPhase, JobProgress, OutcomeKind, ScrapeJobLog, ScrapeLogLevel,
        ScrapeOutcome,
    },
    traits::BroadcastPublisher,
};

/// 向广播通道发布单个任务的日志、进度和抓取结果
///
/// 广播是尽力而为的，没有订阅者时事件直接丢弃。
#[derive(Clone)]
pub struct ProgressReporter {
    publisher: Arc<dyn BroadcastPublisher>,
    job_id: String,
    runner_id: String,
}

impl ProgressReporter {
    pub fn new(publisher: Arc<dyn BroadcastPublisher>, job_id: impl Into<String>, runner_id: impl Into<String>) -> Self {
        Self {
            publisher,
            job_id: job_id.into(),
            runner_id: runner_id.into(),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn log(&self, level: ScrapeLogLevel, message: impl Into<String>) -> usize {
        let log = ScrapeJobLog::new(&self.job_id, &self.runner_id, level, message);
        self.publisher.publish(BroadcastEvent::RunnerLog(log))
    }

    pub fn log_sku(&self, level: ScrapeLogLevel, sku: &str, message: impl Into<String>) -> usize {
        let log = ScrapeJobLog::new(&self.job_id, &self.runner_id, level, message).with_sku(sku);
        self.publisher.publish(BroadcastEvent::RunnerLog(log))
    }

    pub fn progress(&self, processed: u32, total: u32, phase: JobPhase) -> usize {
        let progress = JobProgress::from_counts(&self.job_id, &self.runner_id, processed, total, phase);
        self.publisher.publish(BroadcastEvent::JobProgress(progress))
    }

    pub fn outcome(&self, sku: &str, kind: OutcomeKind, name: &str, success: bool) -> usize {
        self.publisher.publish(BroadcastEvent::Outcome(ScrapeOutcome {
            job_id: self.job_id.clone(),
            runner_id: self.runner_id.clone(),
            sku: sku.to_string(),
            kind,
            name: name.to_string(),
            success,
            timestamp: Utc::now(),
        }))
    }
}
