//! 操作中间件：超时与统计

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::TransferOperation;
use crate::queue::TransferTask;
use crate::retry::ErrorClassifier;
use crate::stats::StatisticsCollector;

/// 超时包装
pub struct TimeoutOperation<O> {
    inner: O,
    timeout: Duration,
}

pub fn with_timeout<O: TransferOperation>(inner: O, timeout: Duration) -> TimeoutOperation<O> {
    TimeoutOperation { inner, timeout }
}

impl<O> TimeoutOperation<O> {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl<O: TransferOperation> TransferOperation for TimeoutOperation<O> {
    async fn execute(
        &self,
        task: &TransferTask,
        cancel: CancellationToken,
    ) -> anyhow::Result<u64> {
        let child = cancel.child_token();
        match tokio::time::timeout(self.timeout, self.inner.execute(task, child.clone())).await {
            Ok(result) => result,
            Err(_) => {
                // 取消子令牌，让操作派生出去的 IO 也停下来
                child.cancel();
                warn!(
                    "任务 {} 执行超时 ({:?})，已取消: {}",
                    task.id, self.timeout, task.source_path
                );
                Err(anyhow::anyhow!(
                    "operation timeout after {}s",
                    self.timeout.as_secs()
                ))
            }
        }
    }
}

/// 统计包装
///
/// 执行前记录一次尝试，执行后按结果记录成功/失败与耗时
pub struct Instrumented<O> {
    inner: O,
    stats: Arc<StatisticsCollector>,
    classifier: ErrorClassifier,
}

pub fn instrument<O: TransferOperation>(
    inner: O,
    stats: Arc<StatisticsCollector>,
    classifier: ErrorClassifier,
) -> Instrumented<O> {
    Instrumented {
        inner,
        stats,
        classifier,
    }
}

#[async_trait]
impl<O: TransferOperation> TransferOperation for Instrumented<O> {
    async fn execute(
        &self,
        task: &TransferTask,
        cancel: CancellationToken,
    ) -> anyhow::Result<u64> {
        self.stats.record_attempt(&task.source_path, task.file_size);
        let start = Instant::now();

        let result = self.inner.execute(task, cancel).await;

        let elapsed = start.elapsed();
        match &result {
            Ok(bytes) => {
                self.stats
                    .record_result(&task.source_path, true, elapsed, *bytes, None);
            }
            Err(e) => {
                let kind = self.classifier.classify_error(e);
                self.stats.record_result(
                    &task.source_path,
                    false,
                    elapsed,
                    task.file_size,
                    Some(kind),
                );
            }
        }
        result
    }
}
