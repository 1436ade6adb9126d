//! 传输统计模块
//!
//! 按天、按小时、按扩展名、按错误类型四个维度聚合尝试/成功/失败次数。
//! 使用独立的锁，统计查询不会阻塞任务分发。

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info};

use crate::queue::file_extension;
use crate::retry::ErrorKind;

const DAY_FORMAT: &str = "%Y-%m-%d";
const HOUR_FORMAT: &str = "%Y-%m-%d %H";

/// 成功率低于该值时告警（百分比）
pub const LOW_SUCCESS_RATE_PERCENT: f64 = 80.0;
/// 平均耗时超过该值时告警（秒）
pub const SLOW_AVERAGE_SECONDS: f64 = 300.0;

/// 统计桶
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatBucket {
    pub attempts: u64,
    pub success: u64,
    pub failed: u64,
    pub bytes: u64,
}

impl StatBucket {
    /// 成功率（百分比），无结果时为 100
    pub fn success_rate(&self) -> f64 {
        let finished = self.success + self.failed;
        if finished == 0 {
            100.0
        } else {
            self.success as f64 / finished as f64 * 100.0
        }
    }
}

/// 单日统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: String,
    #[serde(flatten)]
    pub bucket: StatBucket,
}

/// 扩展名统计
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionStat {
    pub extension: String,
    #[serde(flatten)]
    pub bucket: StatBucket,
}

/// 性能摘要
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSummary {
    pub total_attempts: u64,
    pub total_success: u64,
    pub total_failed: u64,
    /// 成功率（百分比）
    pub success_rate: f64,
    /// 平均上传耗时（秒）
    pub average_duration_secs: f64,
    /// 累计传输字节数
    pub total_bytes: u64,
    /// 平均吞吐（字节/秒）
    pub average_throughput: f64,
    /// 尝试次数最多的小时（"%Y-%m-%d %H"）
    pub busiest_hour: Option<String>,
}

/// 单类错误统计
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorKindStat {
    pub kind: ErrorKind,
    pub count: u64,
    /// 占全部错误的百分比
    pub percentage: f64,
}

/// 错误分析
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub total_errors: u64,
    /// 按次数降序
    pub by_kind: Vec<ErrorKindStat>,
    pub most_common: Option<ErrorKind>,
}

#[derive(Debug, Default)]
struct StatsState {
    daily: BTreeMap<String, StatBucket>,
    hourly: BTreeMap<String, StatBucket>,
    by_extension: HashMap<String, StatBucket>,
    by_error: HashMap<ErrorKind, u64>,
    total_attempts: u64,
    total_success: u64,
    total_failed: u64,
    total_bytes: u64,
    average_duration_secs: f64,
}

/// 统计收集器
#[derive(Debug, Default)]
pub struct StatisticsCollector {
    state: Mutex<StatsState>,
}

impl StatisticsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一次尝试
    pub fn record_attempt(&self, path: &str, size: u64) {
        self.record_attempt_at(path, size, Local::now());
    }

    pub fn record_attempt_at(&self, path: &str, size: u64, now: DateTime<Local>) {
        let day = now.format(DAY_FORMAT).to_string();
        let hour = now.format(HOUR_FORMAT).to_string();
        let ext = file_extension(path);

        let mut state = self.state.lock();
        state.total_attempts += 1;
        state.daily.entry(day).or_default().attempts += 1;
        state.hourly.entry(hour).or_default().attempts += 1;
        let bucket = state.by_extension.entry(ext).or_default();
        bucket.attempts += 1;
        bucket.bytes += size;
    }

    /// 记录一次结果
    pub fn record_result(
        &self,
        path: &str,
        success: bool,
        duration: Duration,
        size: u64,
        error_kind: Option<ErrorKind>,
    ) {
        self.record_result_at(path, success, duration, size, error_kind, Local::now());
    }

    pub fn record_result_at(
        &self,
        path: &str,
        success: bool,
        duration: Duration,
        size: u64,
        error_kind: Option<ErrorKind>,
        now: DateTime<Local>,
    ) {
        let day = now.format(DAY_FORMAT).to_string();
        let hour = now.format(HOUR_FORMAT).to_string();
        let ext = file_extension(path);

        let mut state = self.state.lock();
        if success {
            state.total_success += 1;
            let n = state.total_success as f64;
            state.average_duration_secs =
                (state.average_duration_secs * (n - 1.0) + duration.as_secs_f64()) / n;
            state.total_bytes += size;

            let daily = state.daily.entry(day).or_default();
            daily.success += 1;
            daily.bytes += size;
            let hourly = state.hourly.entry(hour).or_default();
            hourly.success += 1;
            hourly.bytes += size;
            state.by_extension.entry(ext).or_default().success += 1;
        } else {
            state.total_failed += 1;
            state.daily.entry(day).or_default().failed += 1;
            state.hourly.entry(hour).or_default().failed += 1;
            state.by_extension.entry(ext).or_default().failed += 1;
            if let Some(kind) = error_kind {
                *state.by_error.entry(kind).or_default() += 1;
            }
        }

        debug!(
            "记录传输结果: path={}, success={}, duration={:.2?}",
            path, success, duration
        );
    }

    /// 清理保留期之外的按天/按小时数据，返回清理的桶数
    pub fn cleanup_old_data(&self, retention_days: u32) -> usize {
        self.cleanup_old_data_at(retention_days, Local::now())
    }

    pub fn cleanup_old_data_at(&self, retention_days: u32, now: DateTime<Local>) -> usize {
        let cutoff = now.date_naive() - ChronoDuration::days(retention_days as i64);
        let cutoff_day = cutoff.format(DAY_FORMAT).to_string();

        let mut state = self.state.lock();
        let before = state.daily.len() + state.hourly.len();
        // 键为定长日期格式，字典序即时间序
        state.daily.retain(|day, _| day.as_str() >= cutoff_day.as_str());
        state
            .hourly
            .retain(|hour, _| hour.get(..10).map_or(false, |day| day >= cutoff_day.as_str()));
        let removed = before - (state.daily.len() + state.hourly.len());

        if removed > 0 {
            info!(
                "清理统计数据: 删除 {} 个早于 {} 的统计桶",
                removed, cutoff_day
            );
        }
        removed
    }

    /// 最近 N 天的每日统计（升序，缺失的日期补零）
    pub fn daily_summary(&self, days: u32) -> Vec<DailyStat> {
        self.daily_summary_at(days, Local::now().date_naive())
    }

    pub fn daily_summary_at(&self, days: u32, today: NaiveDate) -> Vec<DailyStat> {
        let state = self.state.lock();
        (0..days as i64)
            .rev()
            .map(|offset| {
                let date = (today - ChronoDuration::days(offset))
                    .format(DAY_FORMAT)
                    .to_string();
                let bucket = state.daily.get(&date).copied().unwrap_or_default();
                DailyStat { date, bucket }
            })
            .collect()
    }

    /// 性能摘要
    pub fn performance_summary(&self) -> PerformanceSummary {
        let state = self.state.lock();
        let finished = state.total_success + state.total_failed;
        let success_rate = if finished == 0 {
            100.0
        } else {
            state.total_success as f64 / finished as f64 * 100.0
        };
        let total_secs = state.average_duration_secs * state.total_success as f64;
        let average_throughput = if total_secs > 0.0 {
            state.total_bytes as f64 / total_secs
        } else {
            0.0
        };
        let busiest_hour = state
            .hourly
            .iter()
            .filter(|(_, b)| b.attempts > 0)
            .max_by(|(ha, a), (hb, b)| a.attempts.cmp(&b.attempts).then_with(|| hb.cmp(ha)))
            .map(|(hour, _)| hour.clone());

        PerformanceSummary {
            total_attempts: state.total_attempts,
            total_success: state.total_success,
            total_failed: state.total_failed,
            success_rate,
            average_duration_secs: state.average_duration_secs,
            total_bytes: state.total_bytes,
            average_throughput,
            busiest_hour,
        }
    }

    /// 错误分析
    pub fn error_analysis(&self) -> ErrorAnalysis {
        let state = self.state.lock();
        let total_errors: u64 = state.by_error.values().sum();

        let mut by_kind: Vec<ErrorKindStat> = state
            .by_error
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(kind, count)| ErrorKindStat {
                kind: *kind,
                count: *count,
                percentage: if total_errors == 0 {
                    0.0
                } else {
                    *count as f64 / total_errors as f64 * 100.0
                },
            })
            .collect();
        by_kind.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.kind.cmp(&b.kind)));

        ErrorAnalysis {
            total_errors,
            most_common: by_kind.first().map(|s| s.kind),
            by_kind,
        }
    }

    /// 按扩展名统计（按尝试次数降序）
    pub fn extension_summary(&self) -> Vec<ExtensionStat> {
        let state = self.state.lock();
        let mut stats: Vec<ExtensionStat> = state
            .by_extension
            .iter()
            .map(|(extension, bucket)| ExtensionStat {
                extension: extension.clone(),
                bucket: *bucket,
            })
            .collect();
        stats.sort_by(|a, b| {
            b.bucket
                .attempts
                .cmp(&a.bucket.attempts)
                .then_with(|| a.extension.cmp(&b.extension))
        });
        stats
    }

    /// 最近有记录的日期
    pub fn latest_day(&self) -> Option<String> {
        self.state.lock().daily.keys().next_back().cloned()
    }

    /// 性能告警
    ///
    /// 结果样本数不足 `min_samples` 时不做判断
    pub fn performance_alerts(&self, min_samples: u64) -> Vec<String> {
        let summary = self.performance_summary();
        let mut alerts = Vec::new();
        if summary.total_success + summary.total_failed < min_samples {
            return alerts;
        }
        if summary.success_rate < LOW_SUCCESS_RATE_PERCENT {
            alerts.push(format!("传输成功率较低: {:.1}%", summary.success_rate));
        }
        if summary.average_duration_secs > SLOW_AVERAGE_SECONDS {
            alerts.push(format!(
                "传输平均耗时过长: {:.1}秒",
                summary.average_duration_secs
            ));
        }
        alerts
    }
}
