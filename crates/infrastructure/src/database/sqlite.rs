use async_trait::async_trait;
use chrono::{DateTime, Utc};
use coordinator_core::errors::CoordinatorError;
use coordinator_core::models::{
    Job, JobChunk, JobGuard, JobQuery, JobStatus, JobUpdate, Metadata, RowChange,
};
use coordinator_core::traits::JobRepository;
use coordinator_core::CoordinatorResult;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::sync::broadcast;
use tracing::{debug, error, instrument};

use crate::notifier::ChangeNotifier;

const JOB_COLUMNS: &str = "id, skus, scrapers, test_mode, max_workers, status, runner_id, metadata, \
     version, created_at, started_at, heartbeat_at, lease_expires_at, completed_at, error_message";

/// 基于 SQLite 的任务存储
///
/// 列表类字段以 JSON 文本存储。所有状态变更都是带条件的 `UPDATE ... RETURNING`，
/// 没有返回行即视为前置条件不满足。
pub struct SqliteJobRepository {
    pool: SqlitePool,
    notifier: ChangeNotifier,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool, notifier: ChangeNotifier) -> Self {
        Self { pool, notifier }
    }

    /// 创建表结构（幂等）
    pub async fn migrate(&self) -> CoordinatorResult<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS scrape_jobs (
                id TEXT PRIMARY KEY,
                skus TEXT NOT NULL,
                scrapers TEXT NOT NULL,
                test_mode INTEGER NOT NULL DEFAULT 0,
                max_workers INTEGER NOT NULL,
                status TEXT NOT NULL,
                runner_id TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                version INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                started_at TEXT,
                heartbeat_at TEXT,
                lease_expires_at TEXT,
                completed_at TEXT,
                error_message TEXT
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_scrape_jobs_status_created ON scrape_jobs(status, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_scrape_jobs_runner ON scrape_jobs(runner_id)",
            r#"
            CREATE TABLE IF NOT EXISTS scrape_job_chunks (
                job_id TEXT NOT NULL REFERENCES scrape_jobs(id),
                chunk_index INTEGER NOT NULL,
                skus TEXT NOT NULL,
                scrapers TEXT NOT NULL,
                status TEXT NOT NULL,
                PRIMARY KEY (job_id, chunk_index)
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                error!("创建任务表失败: {}", e);
                CoordinatorError::from(e)
            })?;
        }
        debug!("任务表结构已就绪");
        Ok(())
    }

    fn row_to_job(row: &SqliteRow) -> CoordinatorResult<Job> {
        let skus: String = row.try_get("skus")?;
        let scrapers: String = row.try_get("scrapers")?;
        let metadata: String = row.try_get("metadata")?;
        let status: String = row.try_get("status")?;

        Ok(Job {
            id: row.try_get("id")?,
            skus: serde_json::from_str(&skus)?,
            scrapers: serde_json::from_str(&scrapers)?,
            test_mode: row.try_get("test_mode")?,
            max_workers: row.try_get("max_workers")?,
            status: status.parse()?,
            runner_id: row.try_get("runner_id")?,
            metadata: serde_json::from_str::<Metadata>(&metadata)?,
            version: row.try_get("version")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            started_at: row.try_get("started_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            lease_expires_at: row.try_get("lease_expires_at")?,
            completed_at: row.try_get("completed_at")?,
            error_message: row.try_get("error_message")?,
        })
    }

    fn row_to_chunk(row: &SqliteRow) -> CoordinatorResult<JobChunk> {
        let skus: String = row.try_get("skus")?;
        let scrapers: String = row.try_get("scrapers")?;
        let status: String = row.try_get("status")?;

        Ok(JobChunk {
            job_id: row.try_get("job_id")?,
            chunk_index: row.try_get("chunk_index")?,
            skus: serde_json::from_str(&skus)?,
            scrapers: serde_json::from_str(&scrapers)?,
            status: status.parse()?,
        })
    }

    /// 把前置条件追加到 WHERE 子句
    fn push_guard<'a>(builder: &mut QueryBuilder<'a, Sqlite>, job_id: &'a str, guard: &'a JobGuard) {
        builder.push(" WHERE id = ");
        builder.push_bind(job_id);
        builder.push(" AND status = ");
        builder.push_bind(guard.status.as_str());
        if let Some(owner) = &guard.owner {
            builder.push(" AND runner_id = ");
            builder.push_bind(owner.as_str());
        }
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(skip(self, job, chunks), fields(job_id = %job.id, chunks = chunks.len()))]
    async fn create_job(&self, job: &Job, chunks: &[JobChunk]) -> CoordinatorResult<Job> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO scrape_jobs (id, skus, scrapers, test_mode, max_workers, status, runner_id,
                metadata, version, created_at, started_at, heartbeat_at, lease_expires_at,
                completed_at, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(serde_json::to_string(&job.skus)?)
        .bind(serde_json::to_string(&job.scrapers)?)
        .bind(job.test_mode)
        .bind(job.max_workers)
        .bind(job.status.as_str())
        .bind(&job.runner_id)
        .bind(serde_json::to_string(&job.metadata)?)
        .bind(job.version)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.heartbeat_at)
        .bind(job.lease_expires_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .execute(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                "INSERT INTO scrape_job_chunks (job_id, chunk_index, skus, scrapers, status) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&chunk.job_id)
            .bind(chunk.chunk_index)
            .bind(serde_json::to_string(&chunk.skus)?)
            .bind(serde_json::to_string(&chunk.scrapers)?)
            .bind(chunk.status.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        self.notifier.notify(RowChange::insert(job.clone()));
        debug!("任务及分片已写入");
        Ok(job.clone())
    }

    #[instrument(skip(self))]
    async fn get_job(&self, job_id: &str) -> CoordinatorResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    #[instrument(skip(self, query))]
    async fn list_jobs(&self, query: &JobQuery) -> CoordinatorResult<Vec<Job>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM scrape_jobs WHERE 1 = 1"));

        if let Some(statuses) = &query.statuses {
            if statuses.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND status IN (");
            let mut separated = builder.separated(", ");
            for status in statuses {
                separated.push_bind(status.as_str());
            }
            separated.push_unseparated(")");
        }

        if let Some(scrapers) = &query.scrapers {
            if scrapers.is_empty() {
                return Ok(Vec::new());
            }
            builder.push(" AND EXISTS (SELECT 1 FROM json_each(scrape_jobs.scrapers) WHERE json_each.value IN (");
            let mut separated = builder.separated(", ");
            for scraper in scrapers {
                separated.push_bind(scraper.as_str());
            }
            separated.push_unseparated("))");
        }

        if let Some(runner_id) = &query.runner_id {
            builder.push(" AND runner_id = ");
            builder.push_bind(runner_id.as_str());
        }

        if query.test_mode_only {
            builder.push(" AND test_mode = 1");
        }

        if query.oldest_first {
            builder.push(" ORDER BY created_at ASC, id ASC");
        } else {
            builder.push(" ORDER BY created_at DESC, id DESC");
        }

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(limit as i64);
        }

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_job).collect()
    }

    #[instrument(skip(self))]
    async fn list_chunks(&self, job_id: &str) -> CoordinatorResult<Vec<JobChunk>> {
        let rows = sqlx::query(
            "SELECT job_id, chunk_index, skus, scrapers, status FROM scrape_job_chunks WHERE job_id = ? ORDER BY chunk_index",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_chunk).collect()
    }

    #[instrument(skip(self, guard, update), fields(expected = %guard.status))]
    async fn update_job_if(
        &self,
        job_id: &str,
        guard: &JobGuard,
        update: &JobUpdate,
    ) -> CoordinatorResult<Option<Job>> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new("UPDATE scrape_jobs SET ");
        match update {
            JobUpdate::Claim {
                runner_id,
                at,
                lease_expires_at,
            } => {
                builder.push("status = ");
                builder.push_bind(JobStatus::Running.as_str());
                builder.push(", runner_id = ");
                builder.push_bind(runner_id.as_str());
                builder.push(", started_at = ");
                builder.push_bind(*at);
                builder.push(", heartbeat_at = ");
                builder.push_bind(*at);
                builder.push(", lease_expires_at = ");
                builder.push_bind(*lease_expires_at);
            }
            JobUpdate::Heartbeat {
                at,
                lease_expires_at,
            } => {
                builder.push("heartbeat_at = ");
                builder.push_bind(*at);
                builder.push(", lease_expires_at = ");
                builder.push_bind(*lease_expires_at);
            }
            JobUpdate::Finish {
                status,
                error_message,
                at,
            } => {
                builder.push("status = ");
                builder.push_bind(status.as_str());
                builder.push(", completed_at = ");
                builder.push_bind(*at);
                builder.push(", error_message = ");
                builder.push_bind(error_message.as_deref());
                builder.push(", lease_expires_at = NULL");
            }
        }
        builder.push(", version = version + 1");
        Self::push_guard(&mut builder, job_id, guard);
        builder.push(format!(" RETURNING {JOB_COLUMNS}"));

        let row = builder.build().fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let job = Self::row_to_job(&row)?;
                self.notifier.notify(RowChange::update(job.clone()));
                Ok(Some(job))
            }
            None => {
                debug!("条件更新未命中任何行");
                Ok(None)
            }
        }
    }

    #[instrument(skip(self))]
    async fn update_chunk_if(
        &self,
        job_id: &str,
        chunk_index: i32,
        expected: JobStatus,
        next: JobStatus,
    ) -> CoordinatorResult<Option<JobChunk>> {
        let row = sqlx::query(
            r#"
            UPDATE scrape_job_chunks SET status = ?
            WHERE job_id = ? AND chunk_index = ? AND status = ?
            RETURNING job_id, chunk_index, skus, scrapers, status
            "#,
        )
        .bind(next.as_str())
        .bind(job_id)
        .bind(chunk_index)
        .bind(expected.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_chunk).transpose()
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<RowChange> {
        self.notifier.subscribe()
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
