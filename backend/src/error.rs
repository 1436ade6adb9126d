//! 引擎错误定义
//!
//! 只覆盖引擎自身的失败（配置、参数、持久化）。
//! 单个任务的执行失败不会以错误形式向外传播，而是由分发循环分类后路由。

use thiserror::Error;

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    /// 配置错误（构造时立即报出）
    #[error("配置错误: {0}")]
    Config(String),

    /// 参数错误
    #[error("参数错误: {0}")]
    InvalidArgument(String),

    /// 持久化错误
    #[error("持久化错误: {0}")]
    Persistence(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// 是否为配置类错误（致命，需要修改配置）
    pub fn is_config_error(&self) -> bool {
        matches!(self, EngineError::Config(_) | EngineError::InvalidArgument(_))
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
