use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::Metadata;

/// Runner在线状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Online,
    Idle,
    Busy,
    Offline,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerStatus::Online => "online",
            RunnerStatus::Idle => "idle",
            RunnerStatus::Busy => "busy",
            RunnerStatus::Offline => "offline",
        }
    }

    /// 看板排序: online > busy > idle > offline
    pub fn display_rank(&self) -> u8 {
        match self {
            RunnerStatus::Online => 0,
            RunnerStatus::Busy => 1,
            RunnerStatus::Idle => 2,
            RunnerStatus::Offline => 3,
        }
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runner的实时在线信息，仅在心跳存续期间存在
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunnerPresence {
    pub runner_id: String,
    pub runner_name: String,
    pub status: RunnerStatus,
    pub active_jobs: u32,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl RunnerPresence {
    pub fn is_active(&self) -> bool {
        self.status != RunnerStatus::Offline
    }

    /// 检查心跳是否超时
    pub fn is_expired(&self, now: DateTime<Utc>, timeout_seconds: i64) -> bool {
        now - self.last_seen > Duration::seconds(timeout_seconds)
    }
}

/// Runner上线通告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerAnnouncement {
    pub runner_id: String,
    pub runner_name: String,
    pub status: Option<RunnerStatus>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Runner心跳
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerHeartbeat {
    pub runner_id: String,
    pub status: RunnerStatus,
    pub active_jobs: u32,
    /// Runner本地时钟，只用于日志，存活判定以协调器收到心跳的时间为准
    pub timestamp: DateTime<Utc>,
}

/// 在线状态变更事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PresenceEvent {
    Joined { presence: RunnerPresence },
    Updated { presence: RunnerPresence },
    Left {
        runner_id: String,
        at: DateTime<Utc>,
    },
}

impl PresenceEvent {
    pub fn runner_id(&self) -> &str {
        match self {
            PresenceEvent::Joined { presence } | PresenceEvent::Updated { presence } => {
                &presence.runner_id
            }
            PresenceEvent::Left { runner_id, .. } => runner_id,
        }
    }
}
