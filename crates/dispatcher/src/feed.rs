//! 任务分配流
//!
//! 把存储的行级变更转换为带类型的 `created`/`updated` 事件并扇出给订阅者。
//! 投递语义为至少一次，同一任务按版本号有序；流不是持久日志，断开后订阅者必须全量重新同步。

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::counter;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use coordinator_core::{
    models::{FeedFilter, JobAssignment, JobEventType, RowChange},
    traits::Subscription,
    CoordinatorError, CoordinatorResult,
};

#[derive(Debug, Clone)]
enum FeedEvent {
    Job(JobAssignment),
    /// 上游丢失了变更，订阅者需要重新同步
    Resync { reason: String },
}

/// 终态任务的版本记录保留时长，期间到达的旧版本变更仍会被丢弃
const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
struct VersionMark {
    version: i64,
    /// 任务进入终态的时间，非终态为 `None`
    terminal_at: Option<Instant>,
}

pub struct JobAssignmentFeed {
    sender: broadcast::Sender<FeedEvent>,
    /// 每个任务已转发的最新版本
    last_versions: DashMap<String, VersionMark>,
    tombstone_retention: Duration,
}

impl JobAssignmentFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            last_versions: DashMap::new(),
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
        }
    }

    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    /// 当前记录版本号的任务数，包括尚未清理的终态任务
    pub fn tracked_jobs(&self) -> usize {
        self.last_versions.len()
    }

    /// 清理超过保留时长的终态记录，返回清理数量
    pub fn prune_tombstones(&self) -> usize {
        let before = self.last_versions.len();
        let retention = self.tombstone_retention;
        self.last_versions.retain(|_, mark| {
            mark.terminal_at
                .map_or(true, |at| at.elapsed() < retention)
        });
        let pruned = before.saturating_sub(self.last_versions.len());
        if pruned > 0 {
            debug!(pruned, "清理终态任务的版本记录");
        }
        pruned
    }

    /// 处理一条行级变更。版本不比已转发的新时丢弃并返回 `None`
    pub fn ingest(&self, change: RowChange) -> Option<JobAssignment> {
        let assignment = JobAssignment::from(change);
        let version = assignment.job.version;
        let terminal = assignment.job.is_terminal();

        let mark = VersionMark {
            version,
            terminal_at: terminal.then(Instant::now),
        };
        match self.last_versions.entry(assignment.job.id.clone()) {
            Entry::Occupied(mut entry) => {
                if version <= entry.get().version {
                    trace!(job_id = %assignment.job.id, version, "丢弃重复或过期的变更");
                    counter!("coordinator_feed_events_total", "kind" => "duplicate").increment(1);
                    return None;
                }
                entry.insert(mark);
                self.forward(&assignment);
            }
            Entry::Vacant(entry) => {
                entry.insert(mark);
                self.forward(&assignment);
            }
        }
        Some(assignment)
    }

    fn forward(&self, assignment: &JobAssignment) {
        let kind = match assignment.event_type {
            JobEventType::Created => "created",
            JobEventType::Updated => "updated",
        };
        counter!("coordinator_feed_events_total", "kind" => kind).increment(1);
        if self.sender.send(FeedEvent::Job(assignment.clone())).is_err() {
            trace!(job_id = %assignment.job.id, "没有分配流订阅者");
        }
    }

    /// 通知所有订阅者重新同步
    pub fn request_resync(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, "任务分配流要求订阅者重新同步");
        counter!("coordinator_feed_events_total", "kind" => "resync").increment(1);
        let _ = self.sender.send(FeedEvent::Resync { reason });
    }

    pub fn subscribe(&self, filter: FeedFilter) -> FeedSubscription {
        FeedSubscription {
            inner: Subscription::new("job_assignment", self.sender.subscribe()),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// 从存储变更通道拉取并转发，直到上游关闭或收到停机信号
    pub async fn run(
        &self,
        mut changes: broadcast::Receiver<RowChange>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("启动任务分配流");
        let mut prune = tokio::time::interval(self.tombstone_retention.max(Duration::from_secs(1)));
        loop {
            tokio::select! {
                _ = prune.tick() => {
                    self.prune_tombstones();
                }
                received = changes.recv() => match received {
                    Ok(change) => {
                        self.ingest(change);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        self.request_resync(format!("变更通知落后，丢失 {skipped} 条"));
                    }
                    Err(RecvError::Closed) => {
                        info!("存储变更通道已关闭，停止任务分配流");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("收到停止信号，停止任务分配流");
                    break;
                }
            }
        }
    }
}

/// 按兴趣过滤的分配流订阅
pub struct FeedSubscription {
    inner: Subscription<FeedEvent>,
    filter: FeedFilter,
}

impl FeedSubscription {
    /// 等待下一条匹配的事件。
    /// 返回 `ChannelDisconnected` 时调用方应重新同步，订阅本身在非关闭的情况下仍可继续使用。
    pub async fn recv(&mut self) -> CoordinatorResult<JobAssignment> {
        loop {
            match self.inner.recv().await? {
                FeedEvent::Job(assignment) if self.filter.matches(&assignment.job) => {
                    return Ok(assignment);
                }
                FeedEvent::Job(assignment) => {
                    debug!(job_id = %assignment.job.id, "事件不匹配订阅条件");
                }
                FeedEvent::Resync { reason } => {
                    return Err(CoordinatorError::ChannelDisconnected(reason));
                }
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn filter(&self) -> &FeedFilter {
        &self.filter
    }
}
