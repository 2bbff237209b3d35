pub mod app_config;
pub mod channels;
pub mod coordinator;
pub mod database;
pub mod runner_observability;

pub use app_config::AppConfig;
pub use channels::{BroadcastConfig, FeedConfig};
pub use coordinator::{CoordinatorConfig, PresenceConfig};
pub use database::DatabaseConfig;
pub use runner_observability::{ObservabilityConfig, RunnerConfig};
