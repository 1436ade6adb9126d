//! 传输操作
//!
//! 队列只负责调度，真正的传输由 `TransferOperation` 实现。
//! 中间件按 `instrument(with_timeout(op))` 的顺序组合，超时也会被统计。

pub mod local_copy;
pub mod middleware;

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::queue::TransferTask;

pub use local_copy::LocalCopyOperation;
pub use middleware::{instrument, with_timeout, Instrumented, TimeoutOperation};

/// 传输操作
///
/// 返回实际传输的字节数。`cancel` 被取消时应尽快返回。
#[async_trait]
pub trait TransferOperation: Send + Sync + 'static {
    async fn execute(&self, task: &TransferTask, cancel: CancellationToken)
        -> anyhow::Result<u64>;
}

#[async_trait]
impl<T: TransferOperation + ?Sized> TransferOperation for Arc<T> {
    async fn execute(
        &self,
        task: &TransferTask,
        cancel: CancellationToken,
    ) -> anyhow::Result<u64> {
        (**self).execute(task, cancel).await
    }
}
