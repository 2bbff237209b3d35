use tokio::sync::broadcast::{self, error::RecvError};

use crate::errors::CoordinatorError;
use crate::models::BroadcastEvent;
use crate::CoordinatorResult;

/// 广播订阅句柄
///
/// 通道不是持久日志: 落后被丢弃或发送端关闭时都返回 `ChannelDisconnected`，
/// 订阅者需要重新同步而不是假设期间没有变化。
#[derive(Debug)]
pub struct Subscription<T> {
    name: &'static str,
    receiver: broadcast::Receiver<T>,
    closed: bool,
}

impl<T: Clone> Subscription<T> {
    pub fn new(name: &'static str, receiver: broadcast::Receiver<T>) -> Self {
        Self {
            name,
            receiver,
            closed: false,
        }
    }

    pub async fn recv(&mut self) -> CoordinatorResult<T> {
        match self.receiver.recv().await {
            Ok(value) => Ok(value),
            Err(RecvError::Lagged(skipped)) => Err(CoordinatorError::ChannelDisconnected(
                format!("{} 订阅落后，丢失 {} 条事件", self.name, skipped),
            )),
            Err(RecvError::Closed) => {
                self.closed = true;
                Err(CoordinatorError::ChannelDisconnected(format!(
                    "{} 通道已关闭",
                    self.name
                )))
            }
        }
    }

    /// 发送端已全部释放，再次接收不会有新数据
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// 临时广播通道的发布端
pub trait BroadcastPublisher: Send + Sync {
    /// 发布事件，返回收到事件的订阅者数量。无人订阅时事件直接丢弃
    fn publish(&self, event: BroadcastEvent) -> usize;

    fn subscribe(&self) -> Subscription<BroadcastEvent>;
}
