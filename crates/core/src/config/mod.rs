//! 协调器配置
//!
//! 加载顺序: 默认值 → TOML 配置文件 → 环境变量（前缀 `COORDINATOR_`，层级分隔符 `__`）。
//!
//! ```toml
//! [database]
//! url = "sqlite://coordinator.db"
//!
//! [presence]
//! heartbeat_timeout_seconds = 90
//! ```

pub mod models;

pub use models::*;
