//! 内存任务存储
//!
//! 以任务ID为键的分片 `DashMap`，条件更新在单个条目的写锁内完成比较和写入，
//! 不同任务之间互不阻塞。变更通知在持有条目锁时发出，保证同一任务的通知有序。

use async_trait::async_trait;
use coordinator_core::errors::CoordinatorError;
use coordinator_core::models::{
    Job, JobChunk, JobGuard, JobQuery, JobStatus, JobUpdate, RowChange,
};
use coordinator_core::traits::JobRepository;
use coordinator_core::CoordinatorResult;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use crate::notifier::ChangeNotifier;

pub struct InMemoryJobRepository {
    jobs: DashMap<String, Job>,
    chunks: DashMap<String, Vec<JobChunk>>,
    notifier: ChangeNotifier,
}

impl InMemoryJobRepository {
    pub fn new(notifier: ChangeNotifier) -> Self {
        Self {
            jobs: DashMap::new(),
            chunks: DashMap::new(),
            notifier,
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

impl Default for InMemoryJobRepository {
    fn default() -> Self {
        Self::new(ChangeNotifier::default())
    }
}

/// 看板按创建时间降序，认领按升序，同一时间再按ID排序
pub(crate) fn sort_jobs(jobs: &mut [Job], oldest_first: bool) {
    jobs.sort_by(|a, b| {
        let ordering = a
            .created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id));
        if oldest_first {
            ordering
        } else {
            ordering.reverse()
        }
    });
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create_job(&self, job: &Job, chunks: &[JobChunk]) -> CoordinatorResult<Job> {
        match self.jobs.entry(job.id.clone()) {
            Entry::Occupied(_) => Err(CoordinatorError::validation(format!(
                "任务ID已存在: {}",
                job.id
            ))),
            Entry::Vacant(entry) => {
                self.chunks.insert(job.id.clone(), chunks.to_vec());
                let created = entry.insert(job.clone());
                self.notifier.notify(RowChange::insert(created.clone()));
                debug!(job_id = %job.id, chunks = chunks.len(), "任务已写入内存存储");
                Ok(created.clone())
            }
        }
    }

    async fn get_job(&self, job_id: &str) -> CoordinatorResult<Option<Job>> {
        Ok(self.jobs.get(job_id).map(|job| job.clone()))
    }

    async fn list_jobs(&self, query: &JobQuery) -> CoordinatorResult<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        sort_jobs(&mut jobs, query.oldest_first);
        if let Some(limit) = query.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    async fn list_chunks(&self, job_id: &str) -> CoordinatorResult<Vec<JobChunk>> {
        Ok(self
            .chunks
            .get(job_id)
            .map(|chunks| chunks.clone())
            .unwrap_or_default())
    }

    async fn update_job_if(
        &self,
        job_id: &str,
        guard: &JobGuard,
        update: &JobUpdate,
    ) -> CoordinatorResult<Option<Job>> {
        let Some(mut job) = self.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        if !guard.matches(&job) {
            return Ok(None);
        }

        update.apply(&mut job);
        let updated = job.clone();
        self.notifier.notify(RowChange::update(updated.clone()));
        Ok(Some(updated))
    }

    async fn update_chunk_if(
        &self,
        job_id: &str,
        chunk_index: i32,
        expected: JobStatus,
        next: JobStatus,
    ) -> CoordinatorResult<Option<JobChunk>> {
        let Some(mut chunks) = self.chunks.get_mut(job_id) else {
            return Ok(None);
        };
        match chunks
            .iter_mut()
            .find(|chunk| chunk.chunk_index == chunk_index)
        {
            Some(chunk) if chunk.status == expected => {
                chunk.status = next;
                Ok(Some(chunk.clone()))
            }
            _ => Ok(None),
        }
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<RowChange> {
        self.notifier.subscribe()
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordinator_core::models::Metadata;

    fn job(id: &str) -> Job {
        Job::new(
            id.to_string(),
            vec!["A".to_string()],
            vec!["amazon".to_string()],
            false,
            3,
            Metadata::new(),
        )
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let repo = InMemoryJobRepository::default();
        let job = job("job-1");
        let chunks = JobChunk::partition(&job.id, &job.skus, &job.scrapers, None);
        repo.create_job(&job, &chunks).await.unwrap();
        assert!(repo.create_job(&job, &chunks).await.is_err());
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_notifies_after_each_mutation() {
        let repo = InMemoryJobRepository::default();
        let mut changes = repo.subscribe_changes();
        let job = job("job-1");
        repo.create_job(&job, &[]).await.unwrap();

        let now = chrono::Utc::now();
        let claim = JobUpdate::Claim {
            runner_id: "r1".to_string(),
            at: now,
            lease_expires_at: now,
        };
        repo.update_job_if("job-1", &JobGuard::status(JobStatus::Pending), &claim)
            .await
            .unwrap()
            .unwrap();
        // 前置条件不满足时不产生通知
        assert!(repo
            .update_job_if("job-1", &JobGuard::status(JobStatus::Pending), &claim)
            .await
            .unwrap()
            .is_none());

        let first = changes.recv().await.unwrap();
        let second = changes.recv().await.unwrap();
        assert_eq!(first.job.version, 1);
        assert_eq!(second.job.version, 2);
        assert!(changes.try_recv().is_err());
    }
}
