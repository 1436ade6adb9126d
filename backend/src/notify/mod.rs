//! 通知与下游触发
//!
//! - `NotificationSink`：面向用户的消息（成功/失败/重试耗尽/健康告警）
//! - `DownstreamTrigger`：传输成功后通知下游（如媒体库刷新），发出即忘

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::queue::{MediaKind, TransferTask};

/// 通知消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn new(title: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 通知出口
pub trait NotificationSink: Send + Sync {
    fn notify(&self, title: &str, text: &str) -> anyhow::Result<()>;
}

/// 只写日志的通知出口
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn notify(&self, title: &str, text: &str) -> anyhow::Result<()> {
        info!("[通知] {}: {}", title, text);
        Ok(())
    }
}

impl NotificationSink for mpsc::UnboundedSender<Notification> {
    fn notify(&self, title: &str, text: &str) -> anyhow::Result<()> {
        self.send(Notification::new(title, text))
            .map_err(|_| anyhow::anyhow!("通知通道已关闭"))
    }
}

/// 发送通知，失败只记日志
pub fn send_notification(sink: &dyn NotificationSink, title: &str, text: &str) {
    if let Err(e) = sink.notify(title, text) {
        warn!("发送通知失败: title={}, error={}", title, e);
    }
}

/// 传输完成事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedTransfer {
    pub task_id: String,
    pub source_path: String,
    pub dest_path: String,
    pub media_kind: MediaKind,
    pub payload: Option<serde_json::Value>,
}

impl From<&TransferTask> for CompletedTransfer {
    fn from(task: &TransferTask) -> Self {
        Self {
            task_id: task.id.clone(),
            source_path: task.source_path.clone(),
            dest_path: task.dest_path.clone(),
            media_kind: task.media_kind(),
            payload: task.payload.clone(),
        }
    }
}

/// 下游触发器
pub trait DownstreamTrigger: Send + Sync {
    fn on_completed(&self, event: CompletedTransfer);
}

impl DownstreamTrigger for mpsc::UnboundedSender<CompletedTransfer> {
    fn on_completed(&self, event: CompletedTransfer) {
        if self.send(event).is_err() {
            warn!("下游触发通道已关闭，丢弃完成事件");
        }
    }
}
