//! 任务队列模块

pub mod task;
pub mod task_queue;

pub use task::{file_extension, MediaKind, TaskPriority, TaskState, TransferTask};
pub use task_queue::{
    QueueSnapshot, RetryOutcome, TaskQueue, COMPLETED_HISTORY_CAPACITY, FAILED_HISTORY_CAPACITY,
};
