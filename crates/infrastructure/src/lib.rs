pub mod broadcast_hub;
pub mod database;
pub mod memory_store;
pub mod notifier;

pub use broadcast_hub::BroadcastHub;
pub use database::{DatabaseManager, SqliteJobRepository};
pub use memory_store::InMemoryJobRepository;
pub use notifier::ChangeNotifier;
