use thiserror::Error;

/// 协调器错误类型定义
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("任务未找到: {id}")]
    JobNotFound { id: String },

    #[error("任务分片未找到: {job_id}#{chunk_index}")]
    ChunkNotFound { job_id: String, chunk_index: i32 },

    #[error("任务 {job_id} 已被其他Runner认领")]
    AlreadyClaimed { job_id: String },

    #[error("Runner {runner_id} 不是任务 {job_id} 的持有者 (当前持有者: {owner:?})")]
    NotOwner {
        job_id: String,
        runner_id: String,
        owner: Option<String>,
    },

    #[error("任务 {job_id} 的状态转换无效: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },

    #[error("任务存储不可用: {0}")]
    StoreUnavailable(String),

    #[error("订阅通道已断开: {0}")]
    ChannelDisconnected(String),

    #[error("数据库错误: {0}")]
    Database(sqlx::Error),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl CoordinatorError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// 调用方可以自行恢复的错误（认领失败、所有权不符、状态冲突、订阅断开等）
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::AlreadyClaimed { .. }
                | Self::NotOwner { .. }
                | Self::InvalidTransition { .. }
                | Self::ChannelDisconnected(_)
                | Self::JobNotFound { .. }
                | Self::ChunkNotFound { .. }
        )
    }

    /// 存储层连接失败，上层应进入降级模式
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<sqlx::Error> for CoordinatorError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed => Self::StoreUnavailable(err.to_string()),
            other => Self::Database(other),
        }
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type CoordinatorResult<T> = std::result::Result<T, CoordinatorError>;
