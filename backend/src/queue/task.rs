//! 传输任务数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::retry::{BackoffPolicy, ErrorKind};

/// 任务优先级
///
/// 数值越小优先级越高；声明顺序与数值一致，派生的 `Ord` 即为调度顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// 高优先级（值=1）
    High = 1,
    /// 普通优先级（值=2）
    Normal = 2,
    /// 低优先级（值=3）
    Low = 3,
}

impl TaskPriority {
    /// 获取优先级数值（数值越小优先级越高）
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// 向高优先级提升一级，High 保持不变
    pub fn escalate(&self) -> TaskPriority {
        match self {
            TaskPriority::Low => TaskPriority::Normal,
            TaskPriority::Normal | TaskPriority::High => TaskPriority::High,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Normal
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// 等待中（包括等待重试）
    Queued,
    /// 执行中
    Active,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

impl TaskState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

/// 媒体类型（按扩展名推断，供下游刷新媒体库使用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    Subtitle,
    Image,
    Metadata,
    Other,
}

impl MediaKind {
    pub fn from_path(path: &str) -> Self {
        let ext = file_extension(path);
        match ext.as_str() {
            "mkv" | "mp4" | "avi" | "ts" | "m2ts" | "mov" | "wmv" | "flv" | "rmvb" | "webm"
            | "iso" | "mpg" | "mpeg" => MediaKind::Video,
            "mp3" | "flac" | "aac" | "wav" | "m4a" | "ape" | "ogg" | "dts" => MediaKind::Audio,
            "srt" | "ass" | "ssa" | "sub" | "vtt" | "sup" | "idx" => MediaKind::Subtitle,
            "jpg" | "jpeg" | "png" | "webp" | "gif" | "bmp" => MediaKind::Image,
            "nfo" | "xml" | "json" => MediaKind::Metadata,
            _ => MediaKind::Other,
        }
    }
}

/// 提取小写扩展名，无扩展名返回 "none"
pub fn file_extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_else(|| "none".to_string())
}

/// 传输任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTask {
    /// 任务唯一标识
    pub id: String,
    /// 源路径（调用方的稳定标识）
    pub source_path: String,
    /// 目标路径
    pub dest_path: String,
    /// 优先级（只升不降）
    pub priority: TaskPriority,
    /// 当前状态
    #[serde(default = "default_state")]
    pub state: TaskState,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 下次重试时间
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// 失败次数（只增不减）
    #[serde(default)]
    pub retry_count: u32,
    /// 最后一次错误信息
    #[serde(default)]
    pub last_error: Option<String>,
    /// 最后一次错误类型
    #[serde(default)]
    pub last_error_kind: Option<ErrorKind>,
    /// 文件大小（字节，未知为 0）
    #[serde(default)]
    pub file_size: u64,
    /// 附加数据（原样透传）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

fn default_state() -> TaskState {
    TaskState::Queued
}

impl TransferTask {
    /// 创建普通优先级任务
    pub fn new(source_path: impl Into<String>, dest_path: impl Into<String>) -> Self {
        Self::with_priority(source_path, dest_path, TaskPriority::Normal)
    }

    /// 创建指定优先级任务
    pub fn with_priority(
        source_path: impl Into<String>,
        dest_path: impl Into<String>,
        priority: TaskPriority,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source_path: source_path.into(),
            dest_path: dest_path.into(),
            priority,
            state: TaskState::Queued,
            created_at: Utc::now(),
            next_retry_at: None,
            retry_count: 0,
            last_error: None,
            last_error_kind: None,
            file_size: 0,
            payload: None,
        }
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// 稳定标识（源路径）
    pub fn key(&self) -> &str {
        &self.source_path
    }

    /// 媒体类型
    pub fn media_kind(&self) -> MediaKind {
        MediaKind::from_path(&self.source_path)
    }

    /// 是否已到重试时间
    pub fn is_ready_for_retry(&self) -> bool {
        self.is_ready_at(Utc::now())
    }

    pub fn is_ready_at(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// 计算并设置下次重试时间
    ///
    /// 不修改 `retry_count`，由调用方在每次重试决策时递增一次
    pub fn schedule_retry(
        &mut self,
        base_delay: std::time::Duration,
        max_delay: std::time::Duration,
        jitter: bool,
    ) -> DateTime<Utc> {
        let policy = BackoffPolicy::new(base_delay, max_delay, jitter);
        self.schedule_retry_at(Utc::now(), &policy)
    }

    /// 以指定时间为起点计算下次重试时间（叠加错误类型倍数）
    pub fn schedule_retry_at(&mut self, now: DateTime<Utc>, policy: &BackoffPolicy) -> DateTime<Utc> {
        let delay = policy.delay_for(self.retry_count, self.last_error_kind);
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        let next = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.next_retry_at = Some(next);
        next
    }

    /// 记录错误
    pub fn record_error(&mut self, message: impl Into<String>, kind: ErrorKind) {
        self.last_error = Some(message.into());
        self.last_error_kind = Some(kind);
    }
}
