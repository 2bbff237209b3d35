pub mod heartbeat_manager;
pub mod job_execution;
pub mod reporter;

pub use heartbeat_manager::HeartbeatManager;
pub use job_execution::JobExecutionManager;
pub use reporter::ProgressReporter;
