//! Runner端代理
//!
//! 上线宣告、周期心跳、轮询认领任务、执行并广播进度，最后上报终态。

pub mod agent;
pub mod components;
pub mod executor;

pub use agent::{RunnerAgent, RunnerAgentBuilder};
pub use components::{HeartbeatManager, JobExecutionManager, ProgressReporter};
pub use executor::{ExecutionOutcome, JobExecutor, SimulatedExecutor};
