//! 退避策略
//!
//! `delay = min(base * 2^retry_count, max)`，可选叠加 `[0, delay * 10%]` 的均匀抖动。
//! 磁盘空间不足时在基础计算之外再乘 3。

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::ErrorKind;

/// 默认抖动比例
pub const DEFAULT_JITTER_FRACTION: f64 = 0.1;

/// 磁盘空间不足时的延迟倍数
pub const DISK_FULL_MULTIPLIER: u32 = 3;

/// 退避策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// 基础延迟
    pub base_delay: Duration,
    /// 最大延迟（抖动和倍数之前）
    pub max_delay: Duration,
    /// 是否添加抖动
    pub jitter: bool,
    /// 抖动比例
    pub jitter_fraction: f64,
    /// 磁盘空间不足倍数
    pub disk_full_multiplier: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(300), true)
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter: bool) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter,
            jitter_fraction: DEFAULT_JITTER_FRACTION,
            disk_full_multiplier: DISK_FULL_MULTIPLIER,
        }
    }

    /// 不带抖动的策略（主要用于测试和可预期的调度）
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// 计算第 retry_count 次重试的基础延迟
    pub fn compute_delay(&self, retry_count: u32) -> Duration {
        compute_delay(
            retry_count,
            self.base_delay,
            self.max_delay,
            self.jitter,
            self.jitter_fraction,
        )
    }

    /// 计算延迟，并按错误类型叠加倍数
    pub fn delay_for(&self, retry_count: u32, kind: Option<ErrorKind>) -> Duration {
        let delay = self.compute_delay(retry_count);
        match kind {
            Some(ErrorKind::DiskFull) => delay.saturating_mul(self.disk_full_multiplier),
            _ => delay,
        }
    }

    /// 该策略可能返回的延迟上界
    pub fn upper_bound(&self, kind: Option<ErrorKind>) -> Duration {
        let bound = Duration::try_from_secs_f64(
            self.max_delay.as_secs_f64() * (1.0 + self.jitter_fraction.max(0.0)),
        )
        .unwrap_or(Duration::MAX);
        match kind {
            Some(ErrorKind::DiskFull) => bound.saturating_mul(self.disk_full_multiplier),
            _ => bound,
        }
    }
}

/// 指数退避（带上限），可选抖动
pub fn compute_delay(
    retry_count: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
    jitter_fraction: f64,
) -> Duration {
    // 2^retry_count 在 f64 上计算，超大指数直接饱和到 max_delay
    let factor = 2f64.powi(retry_count.min(1023) as i32);
    let raw_secs = base_delay.as_secs_f64() * factor;
    let delay = if !raw_secs.is_finite() || raw_secs >= max_delay.as_secs_f64() {
        max_delay
    } else {
        Duration::try_from_secs_f64(raw_secs).unwrap_or(max_delay)
    };

    if jitter && jitter_fraction > 0.0 {
        let jitter_secs = delay.as_secs_f64() * jitter_fraction * rand::random::<f64>();
        Duration::try_from_secs_f64(jitter_secs)
            .ok()
            .and_then(|extra| delay.checked_add(extra))
            .unwrap_or(Duration::MAX)
    } else {
        delay
    }
}
