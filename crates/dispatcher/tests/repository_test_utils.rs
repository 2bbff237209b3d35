#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use coordinator_core::models::{Job, JobChunk, JobGuard, JobQuery, JobStatus, JobUpdate, RowChange};
use coordinator_core::{CoordinatorError, CoordinatorResult, JobRepository};
use coordinator_infrastructure::{ChangeNotifier, InMemoryJobRepository};

/// 可按操作类别注入存储故障的内存仓库
pub struct FlakyRepository {
    inner: InMemoryJobRepository,
    fail_reads: AtomicBool,
    fail_chunk_updates: AtomicBool,
}

impl FlakyRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryJobRepository::new(ChangeNotifier::new(256)),
            fail_reads: AtomicBool::new(false),
            fail_chunk_updates: AtomicBool::new(false),
        })
    }

    /// 读取任务列表和单个任务时返回存储不可用
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_chunk_updates(&self, fail: bool) {
        self.fail_chunk_updates.store(fail, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, operation: &str) -> CoordinatorResult<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(CoordinatorError::StoreUnavailable(format!(
                "{operation}: connection refused"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl JobRepository for FlakyRepository {
    async fn create_job(&self, job: &Job, chunks: &[JobChunk]) -> CoordinatorResult<Job> {
        self.inner.create_job(job, chunks).await
    }

    async fn get_job(&self, job_id: &str) -> CoordinatorResult<Option<Job>> {
        Self::check(&self.fail_reads, "get_job")?;
        self.inner.get_job(job_id).await
    }

    async fn list_jobs(&self, query: &JobQuery) -> CoordinatorResult<Vec<Job>> {
        Self::check(&self.fail_reads, "list_jobs")?;
        self.inner.list_jobs(query).await
    }

    async fn list_chunks(&self, job_id: &str) -> CoordinatorResult<Vec<JobChunk>> {
        self.inner.list_chunks(job_id).await
    }

    async fn update_job_if(
        &self,
        job_id: &str,
        guard: &JobGuard,
        update: &JobUpdate,
    ) -> CoordinatorResult<Option<Job>> {
        self.inner.update_job_if(job_id, guard, update).await
    }

    async fn update_chunk_if(
        &self,
        job_id: &str,
        chunk_index: i32,
        expected: JobStatus,
        next: JobStatus,
    ) -> CoordinatorResult<Option<JobChunk>> {
        Self::check(&self.fail_chunk_updates, "update_chunk_if")?;
        self.inner
            .update_chunk_if(job_id, chunk_index, expected, next)
            .await
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<RowChange> {
        self.inner.subscribe_changes()
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        Self::check(&self.fail_reads, "health_check")?;
        self.inner.health_check().await
    }
}
