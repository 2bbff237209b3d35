//! 任务存储接口
//!
//! 任务存储是任务和分片的唯一事实来源。所有状态变更都通过条件更新完成:
//! "UPDATE ... WHERE status = $expected [AND runner_id = $owner]"，
//! 调用方必须检查受影响行数，零行即视为转换失败。

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::models::{Job, JobChunk, JobGuard, JobQuery, JobStatus, JobUpdate, RowChange};
use crate::CoordinatorResult;

/// 任务存储抽象接口
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// 原子地创建任务及其全部分片，失败时不留下任何部分状态
    async fn create_job(&self, job: &Job, chunks: &[JobChunk]) -> CoordinatorResult<Job>;

    async fn get_job(&self, job_id: &str) -> CoordinatorResult<Option<Job>>;

    async fn list_jobs(&self, query: &JobQuery) -> CoordinatorResult<Vec<Job>>;

    async fn list_chunks(&self, job_id: &str) -> CoordinatorResult<Vec<JobChunk>>;

    /// 条件更新任务。前置条件不满足（零行受影响）时返回 `None`
    async fn update_job_if(
        &self,
        job_id: &str,
        guard: &JobGuard,
        update: &JobUpdate,
    ) -> CoordinatorResult<Option<Job>>;

    /// 条件更新分片状态，语义同 [`JobRepository::update_job_if`]
    async fn update_chunk_if(
        &self,
        job_id: &str,
        chunk_index: i32,
        expected: JobStatus,
        next: JobStatus,
    ) -> CoordinatorResult<Option<JobChunk>>;

    /// 订阅提交后的行级变更通知
    fn subscribe_changes(&self) -> broadcast::Receiver<RowChange>;

    async fn health_check(&self) -> CoordinatorResult<()>;
}
