//! 本地复制执行器
//!
//! 将源文件（可以是软链接）复制到目标路径，目标目录不存在时先创建。
//! 目标已存在时视为成功，不覆盖。

use anyhow::Context;
use async_trait::async_trait;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TransferOperation;
use crate::queue::TransferTask;

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCopyOperation;

impl LocalCopyOperation {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransferOperation for LocalCopyOperation {
    async fn execute(
        &self,
        task: &TransferTask,
        cancel: CancellationToken,
    ) -> anyhow::Result<u64> {
        let dest = Path::new(&task.dest_path);

        if let Some(folder) = dest.parent() {
            if !folder.as_os_str().is_empty() && !tokio::fs::try_exists(folder).await.unwrap_or(false)
            {
                tokio::fs::create_dir_all(folder)
                    .await
                    .with_context(|| format!("创建文件夹失败: {}", folder.display()))?;
                info!("创建文件夹 {}", folder.display());
            }
        }

        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            info!("{} 已存在，跳过复制", task.dest_path);
            return Ok(0);
        }

        debug!("开始复制: {} -> {}", task.source_path, task.dest_path);

        // fs::copy 跟随软链接，复制的是真实文件内容
        let copied = tokio::select! {
            biased;

            _ = cancel.cancelled() => None,
            result = tokio::fs::copy(&task.source_path, dest) => Some(result),
        };

        match copied {
            Some(result) => {
                let bytes = result.with_context(|| {
                    format!("复制文件失败: {} -> {}", task.source_path, task.dest_path)
                })?;
                info!("复制完成: {} ({} 字节)", task.dest_path, bytes);
                Ok(bytes)
            }
            None => {
                // 中途取消会留下不完整的目标文件
                if let Err(e) = tokio::fs::remove_file(dest).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!("清理未完成的目标文件失败: {}, error={}", task.dest_path, e);
                    }
                }
                anyhow::bail!("复制已取消: {}", task.source_path)
            }
        }
    }
}
