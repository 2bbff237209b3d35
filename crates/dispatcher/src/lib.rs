//! 协调核心的调度侧组件
//!
//! 任务生命周期引擎、Runner在线状态、任务分配流及其订阅视图、广播视图和分布统计。

pub mod broadcast_view;
pub mod distribution;
pub mod feed;
pub mod job_view;
pub mod lifecycle;
pub mod presence;

pub use broadcast_view::{BroadcastSubscriber, BroadcastView};
pub use distribution::*;
pub use feed::{FeedSubscription, JobAssignmentFeed};
pub use job_view::{JobBucketView, JobSubscriber, ViewState};
pub use lifecycle::*;
pub use presence::{PresenceMonitor, PresenceRegistry, SweepOutcome};
