//! # 数据模型
//!
//! 抓取任务协调的核心数据结构。
//!
//! - [`Job`] / [`JobChunk`]: 持久化的任务和分片，唯一的事实来源
//! - [`RunnerPresence`]: Runner的在线状态，不落库，只靠心跳维持
//! - [`JobAssignment`]: 任务分配流上投递的事件
//! - [`BroadcastEvent`]: 日志、进度等临时广播，不保证送达
//!
//! ## 任务状态流转
//! ```text
//! pending → running → completed
//!    ↓         ↓  ↘
//! cancelled  failed  cancelled
//! ```

pub mod broadcast;
pub mod feed;
pub mod job;
pub mod runner;

pub use broadcast::*;
pub use feed::*;
pub use job::*;
pub use runner::*;
