pub mod sqlite;

pub use sqlite::SqliteJobRepository;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use coordinator_core::config::DatabaseConfig;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// SQLite 连接池管理
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("无效的数据库URL: {}", config.url))?
            .create_if_missing(true);

        // 每个 :memory: 连接都是独立的数据库，只能使用单连接且不能回收
        let in_memory = config.url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds));
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(config.max_connections)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .context("连接数据库失败")?;

        info!(url = %config.url, "数据库连接池已创建");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
