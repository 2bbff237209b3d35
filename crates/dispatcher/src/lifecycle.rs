//! 任务生命周期引擎
//!
//! 负责任务和分片的状态转换规则、Runner所有权以及认领/上报操作。
//! 引擎本身不持有状态，所有互斥都依赖存储层的条件更新。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use metrics::counter;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use coordinator_core::{
    config::CoordinatorConfig,
    models::{
        validate_metadata, HealthClass, HealthTally, Job, JobChunk, JobGuard, JobOptions,
        JobQuery, JobStatus, JobSubmission, JobUpdate, SubmissionReceipt,
    },
    traits::JobRepository,
    CoordinatorError, CoordinatorResult,
};

/// 一次 `claim_next` 最多尝试的候选任务数
const CLAIM_CANDIDATE_BATCH: usize = 32;

/// 分片上报结果。最后一个分片到达终态时附带被自动收尾的任务
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkReport {
    pub chunk: JobChunk,
    pub finalized_job: Option<Job>,
}

/// 任务生命周期服务接口
#[async_trait]
pub trait JobLifecycleService: Send + Sync {
    /// 认领最早的待处理任务，没有可认领任务时返回 `None`
    async fn claim_next(
        &self,
        runner_id: &str,
        scrapers: Option<&[String]>,
    ) -> CoordinatorResult<Option<Job>>;

    async fn claim_job(&self, job_id: &str, runner_id: &str) -> CoordinatorResult<Job>;

    /// 续期任务租约
    async fn heartbeat_job(&self, job_id: &str, runner_id: &str) -> CoordinatorResult<Job>;

    async fn report_terminal(
        &self,
        job_id: &str,
        runner_id: &str,
        status: JobStatus,
        error_message: Option<String>,
    ) -> CoordinatorResult<Job>;

    async fn get_job(&self, job_id: &str) -> CoordinatorResult<Job>;
}

pub struct JobLifecycleEngine {
    repo: Arc<dyn JobRepository>,
    config: CoordinatorConfig,
}

impl JobLifecycleEngine {
    pub fn new(repo: Arc<dyn JobRepository>, config: CoordinatorConfig) -> Self {
        Self { repo, config }
    }

    pub fn repository(&self) -> Arc<dyn JobRepository> {
        self.repo.clone()
    }

    fn validate_request(
        &self,
        skus: &[String],
        scrapers: &[String],
        options: &JobOptions,
    ) -> CoordinatorResult<i32> {
        if skus.is_empty() {
            return Err(CoordinatorError::validation("SKU列表不能为空"));
        }
        if skus.iter().any(|sku| sku.trim().is_empty()) {
            return Err(CoordinatorError::validation("SKU不能为空字符串"));
        }
        if scrapers.is_empty() {
            return Err(CoordinatorError::validation("抓取器列表不能为空"));
        }
        if scrapers.iter().any(|name| name.trim().is_empty()) {
            return Err(CoordinatorError::validation("抓取器名称不能为空字符串"));
        }

        let max_workers = options
            .max_workers
            .unwrap_or(self.config.default_max_workers);
        if max_workers <= 0 {
            return Err(CoordinatorError::validation(format!(
                "max_workers 必须大于0: {max_workers}"
            )));
        }
        if options.chunk_size == Some(0) {
            return Err(CoordinatorError::validation("分片大小必须大于0"));
        }

        validate_metadata(
            &options.metadata,
            self.config.max_metadata_entries,
            self.config.max_metadata_key_len,
        )?;

        Ok(max_workers)
    }

    /// 创建任务及其分片，二者作为一个整体原子写入
    pub async fn create_job(
        &self,
        skus: Vec<String>,
        scrapers: Vec<String>,
        options: JobOptions,
    ) -> CoordinatorResult<Job> {
        let max_workers = self.validate_request(&skus, &scrapers, &options)?;

        let job = Job::new(
            Uuid::new_v4().to_string(),
            skus,
            scrapers,
            options.test_mode,
            max_workers,
            options.metadata,
        );
        let chunks = JobChunk::partition(&job.id, &job.skus, &job.scrapers, options.chunk_size);
        if chunks.is_empty() {
            return Err(CoordinatorError::validation("任务至少需要一个分片"));
        }

        let created = self
            .repo
            .create_job(&job, &chunks)
            .await
            .inspect_err(|e| log_store_error("create_job", e))?;

        counter!("coordinator_jobs_created_total").increment(1);
        info!(
            job_id = %created.id,
            skus = created.skus.len(),
            scrapers = ?created.scrapers,
            chunks = chunks.len(),
            test_mode = created.test_mode,
            "创建抓取任务"
        );
        Ok(created)
    }

    /// 把一次提交按轮询方式拆分为 `min(max_runners, |skus|)` 个任务
    pub async fn submit_jobs(
        &self,
        submission: JobSubmission,
    ) -> CoordinatorResult<SubmissionReceipt> {
        let options = submission.options();
        self.validate_request(&submission.skus, &submission.scrapers, &options)?;

        let max_runners = submission
            .max_runners
            .unwrap_or(self.config.max_jobs_per_submission);
        if max_runners == 0 {
            return Err(CoordinatorError::validation("max_runners 必须大于0"));
        }

        let groups = split_round_robin(&submission.skus, max_runners);
        let mut job_ids = Vec::with_capacity(groups.len());
        for group in groups {
            let job = self
                .create_job(group, submission.scrapers.clone(), options.clone())
                .await?;
            job_ids.push(job.id);
        }

        info!(jobs = job_ids.len(), skus = submission.skus.len(), "提交已拆分为任务");
        Ok(SubmissionReceipt {
            job_ids,
            status: JobStatus::Pending,
        })
    }

    pub async fn list_jobs(&self, query: &JobQuery) -> CoordinatorResult<Vec<Job>> {
        self.repo
            .list_jobs(query)
            .await
            .inspect_err(|e| log_store_error("list_jobs", e))
    }

    pub async fn list_chunks(&self, job_id: &str) -> CoordinatorResult<Vec<JobChunk>> {
        self.repo.list_chunks(job_id).await
    }

    /// 分片开始执行，只有任务持有者可以操作
    pub async fn start_chunk(
        &self,
        job_id: &str,
        chunk_index: i32,
        runner_id: &str,
    ) -> CoordinatorResult<JobChunk> {
        self.ensure_running_owner(job_id, runner_id).await?;

        match self
            .repo
            .update_chunk_if(job_id, chunk_index, JobStatus::Pending, JobStatus::Running)
            .await?
        {
            Some(chunk) => {
                debug!(job_id, chunk_index, runner_id, "分片开始执行");
                Ok(chunk)
            }
            None => Err(self
                .diagnose_chunk(job_id, chunk_index, JobStatus::Running)
                .await),
        }
    }

    /// 上报分片终态；所有分片都到达终态时自动收尾任务
    pub async fn report_chunk(
        &self,
        job_id: &str,
        chunk_index: i32,
        runner_id: &str,
        status: JobStatus,
    ) -> CoordinatorResult<ChunkReport> {
        if !status.is_terminal() {
            return Err(CoordinatorError::validation(format!(
                "分片上报的状态必须是终态: {status}"
            )));
        }
        self.ensure_running_owner(job_id, runner_id).await?;

        // 未显式开始的分片也允许直接上报
        let mut updated = None;
        for expected in [JobStatus::Running, JobStatus::Pending] {
            updated = self
                .repo
                .update_chunk_if(job_id, chunk_index, expected, status)
                .await?;
            if updated.is_some() {
                break;
            }
        }
        let Some(chunk) = updated else {
            return Err(self.diagnose_chunk(job_id, chunk_index, status).await);
        };
        debug!(job_id, chunk_index, status = %status, "分片已到达终态");

        let chunks = self.repo.list_chunks(job_id).await?;
        if !chunks.iter().all(|c| c.status.is_terminal()) {
            return Ok(ChunkReport {
                chunk,
                finalized_job: None,
            });
        }

        let final_status = aggregate_chunk_status(&chunks);
        let failed = chunks
            .iter()
            .filter(|c| c.status == JobStatus::Failed)
            .count();
        let error_message = (failed > 0).then(|| format!("{failed} 个分片执行失败"));
        let finish = JobUpdate::Finish {
            status: final_status,
            error_message,
            at: Utc::now(),
        };

        let finalized = match self
            .repo
            .update_job_if(job_id, &JobGuard::owned(JobStatus::Running, runner_id), &finish)
            .await?
        {
            Some(job) => {
                self.record_terminal(&job);
                job
            }
            // 并发的收尾已经完成
            None => self.get_job(job_id).await?,
        };

        Ok(ChunkReport {
            chunk,
            finalized_job: Some(finalized),
        })
    }

    async fn ensure_running_owner(&self, job_id: &str, runner_id: &str) -> CoordinatorResult<Job> {
        let job = self.get_job(job_id).await?;
        if !job.is_owned_by(runner_id) {
            warn!(job_id, runner_id, owner = ?job.runner_id, "非持有者尝试操作任务");
            return Err(CoordinatorError::NotOwner {
                job_id: job_id.to_string(),
                runner_id: runner_id.to_string(),
                owner: job.runner_id,
            });
        }
        if job.status != JobStatus::Running {
            return Err(CoordinatorError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }
        Ok(job)
    }

    async fn diagnose_chunk(
        &self,
        job_id: &str,
        chunk_index: i32,
        target: JobStatus,
    ) -> CoordinatorError {
        match self.repo.list_chunks(job_id).await {
            Ok(chunks) => match chunks.into_iter().find(|c| c.chunk_index == chunk_index) {
                Some(chunk) => CoordinatorError::InvalidTransition {
                    job_id: format!("{job_id}#{chunk_index}"),
                    from: chunk.status.to_string(),
                    to: target.to_string(),
                },
                None => CoordinatorError::ChunkNotFound {
                    job_id: job_id.to_string(),
                    chunk_index,
                },
            },
            Err(e) => e,
        }
    }

    /// 条件更新零行受影响时，读取当前状态判断失败原因
    async fn diagnose_claim(&self, job_id: &str) -> CoordinatorError {
        match self.repo.get_job(job_id).await {
            Ok(None) => CoordinatorError::JobNotFound {
                id: job_id.to_string(),
            },
            Ok(Some(job)) if job.runner_id.is_some() || job.status == JobStatus::Pending => {
                CoordinatorError::AlreadyClaimed {
                    job_id: job_id.to_string(),
                }
            }
            Ok(Some(job)) => CoordinatorError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: JobStatus::Running.to_string(),
            },
            Err(e) => e,
        }
    }

    async fn diagnose_owned_update(
        &self,
        job_id: &str,
        runner_id: &str,
        target: JobStatus,
    ) -> CoordinatorError {
        match self.repo.get_job(job_id).await {
            Ok(None) => CoordinatorError::JobNotFound {
                id: job_id.to_string(),
            },
            Ok(Some(job)) if !job.is_owned_by(runner_id) => {
                warn!(
                    job_id,
                    runner_id,
                    owner = ?job.runner_id,
                    status = %job.status,
                    "拒绝非持有者的任务更新，Runner可能持有过期状态"
                );
                CoordinatorError::NotOwner {
                    job_id: job_id.to_string(),
                    runner_id: runner_id.to_string(),
                    owner: job.runner_id,
                }
            }
            Ok(Some(job)) => CoordinatorError::InvalidTransition {
                job_id: job_id.to_string(),
                from: job.status.to_string(),
                to: target.to_string(),
            },
            Err(e) => e,
        }
    }

    /// 任务终态向仍未结束的分片级联，已是终态的分片保持不变，可重复执行
    async fn cascade_to_chunks(&self, job_id: &str, status: JobStatus) -> CoordinatorResult<()> {
        let chunks = self.repo.list_chunks(job_id).await?;
        for chunk in chunks.into_iter().filter(|c| !c.status.is_terminal()) {
            if self
                .repo
                .update_chunk_if(job_id, chunk.chunk_index, chunk.status, status)
                .await?
                .is_none()
            {
                debug!(job_id, chunk_index = chunk.chunk_index, "分片已被并发更新，跳过级联");
            }
        }
        Ok(())
    }

    fn record_terminal(&self, job: &Job) {
        counter!("coordinator_terminal_reports_total", "status" => job.status.as_str())
            .increment(1);
        match job.status {
            JobStatus::Failed => warn!(
                job_id = %job.id,
                runner_id = ?job.runner_id,
                error = ?job.error_message,
                "任务执行失败"
            ),
            _ => info!(job_id = %job.id, runner_id = ?job.runner_id, status = %job.status, "任务已结束"),
        }
    }

    fn lease_update(&self) -> JobUpdate {
        let now = Utc::now();
        JobUpdate::Heartbeat {
            at: now,
            lease_expires_at: now + Duration::seconds(self.config.lease_seconds),
        }
    }
}

#[async_trait]
impl JobLifecycleService for JobLifecycleEngine {
    async fn claim_next(
        &self,
        runner_id: &str,
        scrapers: Option<&[String]>,
    ) -> CoordinatorResult<Option<Job>> {
        let query = JobQuery {
            scrapers: scrapers.filter(|s| !s.is_empty()).map(|s| s.to_vec()),
            limit: Some(CLAIM_CANDIDATE_BATCH),
            ..JobQuery::pending_oldest_first()
        };
        let candidates = self.list_jobs(&query).await?;

        for candidate in candidates {
            match self.claim_job(&candidate.id, runner_id).await {
                Ok(job) => return Ok(Some(job)),
                Err(CoordinatorError::AlreadyClaimed { .. })
                | Err(CoordinatorError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    async fn claim_job(&self, job_id: &str, runner_id: &str) -> CoordinatorResult<Job> {
        if runner_id.trim().is_empty() {
            return Err(CoordinatorError::validation("Runner ID不能为空"));
        }

        let now = Utc::now();
        let claim = JobUpdate::Claim {
            runner_id: runner_id.to_string(),
            at: now,
            lease_expires_at: now + Duration::seconds(self.config.lease_seconds),
        };

        let updated = self
            .repo
            .update_job_if(job_id, &JobGuard::status(JobStatus::Pending), &claim)
            .await
            .inspect_err(|e| log_store_error("claim_job", e))?;

        match updated {
            Some(job) => {
                counter!("coordinator_claims_total", "outcome" => "won").increment(1);
                info!(job_id, runner_id, "Runner认领任务成功");
                Ok(job)
            }
            None => {
                counter!("coordinator_claims_total", "outcome" => "lost").increment(1);
                let err = self.diagnose_claim(job_id).await;
                debug!(job_id, runner_id, error = %err, "认领任务失败");
                Err(err)
            }
        }
    }

    async fn heartbeat_job(&self, job_id: &str, runner_id: &str) -> CoordinatorResult<Job> {
        let updated = self
            .repo
            .update_job_if(
                job_id,
                &JobGuard::owned(JobStatus::Running, runner_id),
                &self.lease_update(),
            )
            .await
            .inspect_err(|e| log_store_error("heartbeat_job", e))?;

        match updated {
            Some(job) => {
                debug!(job_id, runner_id, lease_expires_at = ?job.lease_expires_at, "任务租约已续期");
                Ok(job)
            }
            None => Err(self
                .diagnose_owned_update(job_id, runner_id, JobStatus::Running)
                .await),
        }
    }

    async fn report_terminal(
        &self,
        job_id: &str,
        runner_id: &str,
        status: JobStatus,
        error_message: Option<String>,
    ) -> CoordinatorResult<Job> {
        if !status.is_terminal() {
            return Err(CoordinatorError::validation(format!(
                "上报的状态必须是终态: {status}"
            )));
        }

        let finish = JobUpdate::Finish {
            status,
            error_message,
            at: Utc::now(),
        };

        // 未被认领的任务可以直接取消，条件更新保证不会与并发认领冲突。
        // 此时没有持有者会写分片，先改任务再级联
        if status == JobStatus::Cancelled {
            let cancelled = self
                .repo
                .update_job_if(job_id, &JobGuard::status(JobStatus::Pending), &finish)
                .await
                .inspect_err(|e| log_store_error("report_terminal", e))?;
            if let Some(job) = cancelled {
                self.record_terminal(&job);
                self.cascade_to_chunks(job_id, status).await.inspect_err(|e| {
                    error!(job_id, error = %e, "任务已取消，级联更新分片状态失败");
                })?;
                return Ok(job);
            }
        }

        // 持有者路径先级联分片再更新任务，分片写入失败时任务保持 running
        let guard = JobGuard::owned(JobStatus::Running, runner_id);
        let current = self.get_job(job_id).await?;
        if !guard.matches(&current) {
            return Err(self.diagnose_owned_update(job_id, runner_id, status).await);
        }
        self.cascade_to_chunks(job_id, status)
            .await
            .inspect_err(|e| log_store_error("report_terminal", e))?;

        let Some(job) = self
            .repo
            .update_job_if(job_id, &guard, &finish)
            .await
            .inspect_err(|e| log_store_error("report_terminal", e))?
        else {
            return Err(self.diagnose_owned_update(job_id, runner_id, status).await);
        };

        self.record_terminal(&job);
        Ok(job)
    }

    async fn get_job(&self, job_id: &str) -> CoordinatorResult<Job> {
        self.repo
            .get_job(job_id)
            .await
            .inspect_err(|e| log_store_error("get_job", e))?
            .ok_or_else(|| CoordinatorError::JobNotFound {
                id: job_id.to_string(),
            })
    }
}

fn log_store_error(operation: &'static str, err: &CoordinatorError) {
    if err.is_store_unavailable() {
        error!(operation, error = %err, "任务存储不可用");
    }
}

/// 轮询拆分SKU，返回的分组数为 `min(groups, |skus|)`
pub fn split_round_robin(skus: &[String], groups: usize) -> Vec<Vec<String>> {
    let count = groups.min(skus.len());
    let mut result = vec![Vec::new(); count];
    if count == 0 {
        return result;
    }
    for (index, sku) in skus.iter().enumerate() {
        result[index % count].push(sku.clone());
    }
    result
}

/// 全部完成为 completed；任一失败为 failed；否则为 cancelled
pub fn aggregate_chunk_status(chunks: &[JobChunk]) -> JobStatus {
    if chunks.iter().all(|c| c.status == JobStatus::Completed) {
        JobStatus::Completed
    } else if chunks.iter().any(|c| c.status == JobStatus::Failed) {
        JobStatus::Failed
    } else {
        JobStatus::Cancelled
    }
}

/// 健康分 = 成功事件数 / 总事件数 × 100，无事件时为 0
pub fn compute_job_health(tally: &HealthTally) -> u8 {
    if tally.total == 0 {
        return 0;
    }
    ((tally.successes as f64 / tally.total as f64) * 100.0).round() as u8
}

pub fn health_class(tally: &HealthTally) -> HealthClass {
    if tally.total == 0 {
        return HealthClass::Unknown;
    }
    let ratio = tally.successes as f64 / tally.total as f64;
    if ratio > 0.9 {
        HealthClass::Healthy
    } else if ratio > 0.6 {
        HealthClass::Degraded
    } else {
        HealthClass::Broken
    }
}
