use coordinator_core::models::BroadcastEvent;
use coordinator_core::traits::{BroadcastPublisher, Subscription};
use metrics::counter;
use tokio::sync::broadcast;
use tracing::trace;

/// 进程内的临时广播中心
///
/// 不持久化、不重放。发送时没有订阅者的事件直接丢失并计数。
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    sender: broadcast::Sender<BroadcastEvent>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl BroadcastPublisher for BroadcastHub {
    fn publish(&self, event: BroadcastEvent) -> usize {
        let name = event.event_name();
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                counter!("coordinator_broadcast_dropped_total", "event" => name).increment(1);
                trace!(event = name, "没有广播订阅者，事件已丢弃");
                0
            }
        }
    }

    fn subscribe(&self) -> Subscription<BroadcastEvent> {
        Subscription::new("broadcast", self.sender.subscribe())
    }
}
