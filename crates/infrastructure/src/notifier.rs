use coordinator_core::models::RowChange;
use tokio::sync::broadcast;
use tracing::trace;

/// 行级变更通知器，作用类似数据库的 LISTEN/NOTIFY
///
/// 只在变更提交之后发送。没有订阅者时通知直接丢弃，存储本身才是事实来源。
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    sender: broadcast::Sender<RowChange>,
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn notify(&self, change: RowChange) {
        let job_id = change.job.id.clone();
        let version = change.job.version;
        if self.sender.send(change).is_err() {
            trace!(job_id = %job_id, version, "没有变更订阅者，通知已丢弃");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RowChange> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}
