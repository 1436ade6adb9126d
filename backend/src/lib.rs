// Transfer Queue Library
// 优先级 + 重试驱动的上传/同步任务队列引擎

// 错误定义
pub mod error;

// 配置管理模块
pub mod config;

// 重试策略模块（错误分类 + 退避）
pub mod retry;

// 任务队列模块
pub mod queue;

// 统计模块
pub mod stats;

// 通知模块
pub mod notify;

// 传输操作模块
pub mod operation;

// 持久化模块
pub mod persistence;

// 分发循环模块
pub mod dispatcher;

// 健康检查模块
pub mod health;

// 引擎入口
pub mod engine;

// 导出常用类型
pub use config::EngineConfig;
pub use dispatcher::{DispatchSettings, Dispatcher};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, EngineResult};
pub use health::{HealthMonitor, HealthReport, UpstreamClient};
pub use notify::{CompletedTransfer, DownstreamTrigger, Notification, NotificationSink};
pub use operation::{LocalCopyOperation, TransferOperation};
pub use persistence::{JsonFileStore, MemoryStore, QueueJournal, StateStore};
pub use queue::{QueueSnapshot, TaskPriority, TaskQueue, TaskState, TransferTask};
pub use retry::{BackoffPolicy, ErrorClassifier, ErrorKind};
pub use stats::StatisticsCollector;
