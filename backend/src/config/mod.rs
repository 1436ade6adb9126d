// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::error::{EngineError, EngineResult};
use crate::retry::BackoffPolicy;

/// 引擎配置
///
/// 所有字段都有默认值，TOML 中缺省的字段使用默认值填充
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 最大同时上传任务数（活跃集合上限，不限制队列深度）
    pub max_concurrent_uploads: usize,
    /// 队列检查间隔（秒）
    pub queue_check_interval_seconds: u64,
    /// 最大尝试次数
    pub max_retry_attempts: u32,
    /// 重试基础延迟（秒）
    pub retry_base_delay_seconds: u64,
    /// 重试最大延迟（秒）
    pub retry_max_delay_seconds: u64,
    /// 是否启用抖动
    pub enable_jitter: bool,
    /// 统计数据保留天数
    pub stats_retention_days: u32,
    /// 健康检查间隔（分钟）
    pub health_check_interval_minutes: u64,
    /// 单次传输超时（秒）
    pub operation_timeout_seconds: u64,
    /// 活跃任务卡死阈值（分钟），超过后由自愈逻辑清理
    pub stuck_task_threshold_minutes: u64,
    /// 成功时是否发送通知
    pub notify_on_success: bool,
    /// 需要做磁盘检查的存储路径
    pub storage_paths: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: 3,
            queue_check_interval_seconds: 5,
            max_retry_attempts: 5,
            retry_base_delay_seconds: 2,
            retry_max_delay_seconds: 300,
            enable_jitter: true,
            stats_retention_days: 30,
            health_check_interval_minutes: 5,
            operation_timeout_seconds: 1800,
            stuck_task_threshold_minutes: 60,
            notify_on_success: false,
            storage_paths: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// 校验配置
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_concurrent_uploads == 0 {
            return Err(EngineError::Config(
                "max_concurrent_uploads 必须大于 0".to_string(),
            ));
        }
        if self.queue_check_interval_seconds == 0 {
            return Err(EngineError::Config(
                "queue_check_interval_seconds 必须大于 0".to_string(),
            ));
        }
        if self.health_check_interval_minutes == 0 {
            return Err(EngineError::Config(
                "health_check_interval_minutes 必须大于 0".to_string(),
            ));
        }
        if self.retry_base_delay_seconds > self.retry_max_delay_seconds {
            return Err(EngineError::Config(format!(
                "retry_base_delay_seconds ({}) 不能大于 retry_max_delay_seconds ({})",
                self.retry_base_delay_seconds, self.retry_max_delay_seconds
            )));
        }
        if self.stats_retention_days == 0 {
            return Err(EngineError::Config(
                "stats_retention_days 必须大于 0".to_string(),
            ));
        }
        if self.operation_timeout_seconds == 0 {
            return Err(EngineError::Config(
                "operation_timeout_seconds 必须大于 0".to_string(),
            ));
        }
        Ok(())
    }

    /// 根据配置构造退避策略
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.retry_base_delay_seconds),
            Duration::from_secs(self.retry_max_delay_seconds),
            self.enable_jitter,
        )
    }

    pub fn queue_check_interval(&self) -> Duration {
        Duration::from_secs(self.queue_check_interval_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_minutes.saturating_mul(60))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_seconds)
    }

    pub fn stuck_task_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_task_threshold_minutes.saturating_mul(60))
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: EngineConfig =
            toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("Invalid config file")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 尝试保存默认配置
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}
