//! 重试策略模块
//!
//! - 错误分类（可重试 / 不可重试）
//! - 指数退避 + 抖动

pub mod backoff;
pub mod classifier;

pub use backoff::BackoffPolicy;
pub use classifier::{ClassifierRule, ErrorClassifier, ErrorKind};
