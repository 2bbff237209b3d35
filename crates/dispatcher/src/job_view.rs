//! 订阅端的分桶任务视图
//!
//! 每个状态一个桶，任务按ID幂等合并，版本号不比已有的新的事件直接忽略。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use coordinator_core::{
    config::FeedConfig,
    models::{FeedFilter, Job, JobAssignment, JobQuery, JobStatus},
    traits::JobRepository,
    CoordinatorError, CoordinatorResult,
};

use crate::distribution::JobCounts;
use crate::feed::JobAssignmentFeed;

/// 视图的连接状态，用来区分“还没有数据”和“与核心通信出错”
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Connecting,
    Live,
    Stale,
}

#[derive(Debug, Clone)]
pub struct JobBucketView {
    buckets: HashMap<JobStatus, Vec<Job>>,
    /// 任务ID -> (所在桶, 版本)
    index: HashMap<String, (JobStatus, i64)>,
    max_per_status: usize,
    state: ViewState,
    last_error: Option<String>,
    synced_at: Option<DateTime<Utc>>,
}

impl JobBucketView {
    pub fn new(max_per_status: usize) -> Self {
        Self {
            buckets: JobStatus::ALL.iter().map(|s| (*s, Vec::new())).collect(),
            index: HashMap::new(),
            max_per_status: max_per_status.max(1),
            state: ViewState::Connecting,
            last_error: None,
            synced_at: None,
        }
    }

    /// 合并一条分配事件，返回视图是否发生变化
    pub fn apply(&mut self, assignment: &JobAssignment) -> bool {
        self.merge(assignment.job.clone())
    }

    fn merge(&mut self, job: Job) -> bool {
        if let Some((bucket, version)) = self.index.get(&job.id).copied() {
            if job.version <= version {
                return false;
            }
            self.remove_from(bucket, &job.id);
        }

        let status = job.status;
        self.index.insert(job.id.clone(), (status, job.version));
        let bucket = self.buckets.entry(status).or_default();
        let position = bucket
            .iter()
            .position(|existing| newer_first(&job, existing))
            .unwrap_or(bucket.len());
        bucket.insert(position, job);

        if bucket.len() > self.max_per_status {
            for evicted in bucket.drain(self.max_per_status..) {
                self.index.remove(&evicted.id);
            }
        }
        true
    }

    fn remove_from(&mut self, status: JobStatus, job_id: &str) {
        if let Some(bucket) = self.buckets.get_mut(&status) {
            bucket.retain(|job| job.id != job_id);
        }
        self.index.remove(job_id);
    }

    /// 用存储中的当前状态整体替换视图
    pub fn resync(&mut self, jobs: Vec<Job>) {
        for bucket in self.buckets.values_mut() {
            bucket.clear();
        }
        self.index.clear();
        for job in jobs {
            self.merge(job);
        }
        self.state = ViewState::Live;
        self.last_error = None;
        self.synced_at = Some(Utc::now());
    }

    /// 保留最后已知的数据，但标记为过期
    pub fn mark_stale(&mut self, reason: impl Into<String>) {
        self.state = ViewState::Stale;
        self.last_error = Some(reason.into());
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.synced_at
    }

    /// 某状态的任务，最新创建的在前
    pub fn bucket(&self, status: JobStatus) -> &[Job] {
        self.buckets.get(&status).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn counts(&self) -> JobCounts {
        let mut counts = JobCounts::default();
        for (status, bucket) in &self.buckets {
            for _ in bucket {
                counts.record(*status);
            }
        }
        counts
    }

    pub fn get_job(&self, job_id: &str) -> Option<&Job> {
        let (status, _) = self.index.get(job_id)?;
        self.bucket(*status).iter().find(|job| job.id == job_id)
    }

    /// 所有桶中最新创建的任务
    pub fn latest_job(&self) -> Option<&Job> {
        self.buckets
            .values()
            .filter_map(|bucket| bucket.first())
            .fold(None, |latest: Option<&Job>, job| match latest {
                Some(current) if !newer_first(job, current) => Some(current),
                _ => Some(job),
            })
    }

    pub fn jobs_for_runner(&self, runner_id: &str) -> Vec<&Job> {
        JobStatus::ALL
            .iter()
            .flat_map(|status| self.bucket(*status))
            .filter(|job| job.is_owned_by(runner_id))
            .collect()
    }

    pub fn all_jobs(&self) -> Vec<Job> {
        JobStatus::ALL
            .iter()
            .flat_map(|status| self.bucket(*status).iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

fn newer_first(candidate: &Job, existing: &Job) -> bool {
    (candidate.created_at, &candidate.id) > (existing.created_at, &existing.id)
}

/// 长期运行的订阅者: 先订阅再全量同步，之后持续把分配流事件合并进视图
pub struct JobSubscriber {
    repo: Arc<dyn JobRepository>,
    feed: Arc<JobAssignmentFeed>,
    filter: FeedFilter,
    view: Arc<RwLock<JobBucketView>>,
    resync_limit: usize,
    retry_interval: Duration,
}

impl JobSubscriber {
    pub fn new(
        repo: Arc<dyn JobRepository>,
        feed: Arc<JobAssignmentFeed>,
        filter: FeedFilter,
        config: &FeedConfig,
    ) -> Self {
        Self {
            repo,
            feed,
            filter,
            view: Arc::new(RwLock::new(JobBucketView::new(config.max_jobs_per_status))),
            resync_limit: config.resync_limit,
            retry_interval: Duration::from_secs(5),
        }
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn view(&self) -> Arc<RwLock<JobBucketView>> {
        self.view.clone()
    }

    /// 当前视图的只读副本
    pub async fn snapshot(&self) -> JobBucketView {
        self.view.read().await.clone()
    }

    /// 从存储重新拉取匹配的任务并替换视图。失败时视图保留旧数据并标记为过期
    pub async fn resync(&self) -> CoordinatorResult<usize> {
        match self.fetch().await {
            Ok(jobs) => {
                let count = jobs.len();
                self.view.write().await.resync(jobs);
                debug!(count, "任务视图已重新同步");
                Ok(count)
            }
            Err(e) => {
                error!("任务视图同步失败: {}", e);
                self.view.write().await.mark_stale(e.to_string());
                Err(e)
            }
        }
    }

    async fn fetch(&self) -> CoordinatorResult<Vec<Job>> {
        let jobs = match &self.filter.job_ids {
            Some(job_ids) => {
                let mut jobs = Vec::with_capacity(job_ids.len());
                for job_id in job_ids {
                    if let Some(job) = self.repo.get_job(job_id).await? {
                        jobs.push(job);
                    }
                }
                jobs
            }
            None => {
                let query = JobQuery {
                    scrapers: self
                        .filter
                        .scrapers
                        .as_ref()
                        .map(|names| names.iter().cloned().collect()),
                    test_mode_only: self.filter.test_mode_only,
                    limit: Some(self.resync_limit),
                    ..JobQuery::default()
                };
                self.repo.list_jobs(&query).await?
            }
        };
        Ok(jobs.into_iter().filter(|job| self.filter.matches(job)).collect())
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        // 先订阅，避免同步期间的变更丢失
        let mut subscription = self.feed.subscribe(self.filter.clone());
        let _ = self.resync().await;
        info!("任务视图订阅已启动");

        loop {
            let stale = self.view.read().await.state() == ViewState::Stale;
            tokio::select! {
                received = subscription.recv() => match received {
                    Ok(assignment) => {
                        self.view.write().await.apply(&assignment);
                    }
                    Err(CoordinatorError::ChannelDisconnected(reason)) if subscription.is_closed() => {
                        warn!(reason = %reason, "任务分配流已关闭，视图停止更新");
                        self.view.write().await.mark_stale(reason);
                        break;
                    }
                    Err(CoordinatorError::ChannelDisconnected(reason)) => {
                        warn!(reason = %reason, "任务分配流中断，重新同步");
                        let _ = self.resync().await;
                    }
                    Err(e) => {
                        error!("任务分配流错误: {}", e);
                        self.view.write().await.mark_stale(e.to_string());
                    }
                },
                _ = tokio::time::sleep(self.retry_interval), if stale => {
                    let _ = self.resync().await;
                }
                _ = shutdown.recv() => {
                    info!("收到停止信号，任务视图订阅退出");
                    break;
                }
            }
        }
    }
}
