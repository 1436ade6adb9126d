//! 健康检查与自愈
//!
//! 每次检查依次运行四个独立子检查（队列、存储、上游客户端、统计），
//! 任一子检查非健康即整体不健康；不健康时按失败组件执行一次自愈动作。
//! 检查和自愈本身的失败只记日志，不会向外传播。

pub mod disk;

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::notify::{send_notification, LogNotifier, NotificationSink};
use crate::persistence::QueueJournal;
use crate::queue::TaskQueue;
use crate::stats::StatisticsCollector;

pub use disk::{classify_usage, disk_usage_percent, DISK_CRITICAL_PERCENT, DISK_WARNING_PERCENT};

/// 检查历史保留数量
pub const HEALTH_HISTORY_CAPACITY: usize = 50;
/// 摘要统计的最近检查次数
pub const SUMMARY_WINDOW: usize = 10;
/// 性能告警的最少样本数
pub const PERFORMANCE_ALERT_MIN_SAMPLES: u64 = 10;

/// 上游客户端（如云盘挂载、对象存储连接）
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    fn name(&self) -> &str;
    async fn ping(&self) -> anyhow::Result<()>;
    async fn reconnect(&self) -> anyhow::Result<()>;
}

/// 存储清理
#[async_trait]
pub trait CleanupSweep: Send + Sync {
    /// 返回清理的条目数
    async fn sweep(&self) -> anyhow::Result<usize>;
}

#[async_trait]
impl CleanupSweep for QueueJournal {
    async fn sweep(&self) -> anyhow::Result<usize> {
        let journal = self.clone();
        Ok(tokio::task::spawn_blocking(move || journal.prune_processed()).await??)
    }
}

/// 检查组件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthComponent {
    Queue,
    Storage,
    Client,
    Statistics,
}

impl std::fmt::Display for HealthComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthComponent::Queue => write!(f, "队列"),
            HealthComponent::Storage => write!(f, "存储"),
            HealthComponent::Client => write!(f, "客户端"),
            HealthComponent::Statistics => write!(f, "统计"),
        }
    }
}

/// 组件状态（按严重程度排序）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Healthy,
    Warning,
    Critical,
}

/// 整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Unhealthy,
}

/// 单个组件的检查结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub component: HealthComponent,
    pub status: ComponentStatus,
    pub message: String,
}

impl ComponentCheck {
    fn new(component: HealthComponent, status: ComponentStatus, message: impl Into<String>) -> Self {
        Self {
            component,
            status,
            message: message.into(),
        }
    }
}

/// 健康报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    pub overall: OverallStatus,
    pub components: Vec<ComponentCheck>,
    pub check_duration: Duration,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.overall == OverallStatus::Healthy
    }

    pub fn component(&self, component: HealthComponent) -> Option<&ComponentCheck> {
        self.components.iter().find(|c| c.component == component)
    }

    /// 非健康的组件
    pub fn failed(&self) -> impl Iterator<Item = &ComponentCheck> {
        self.components
            .iter()
            .filter(|c| c.status != ComponentStatus::Healthy)
    }

    pub fn warning_count(&self) -> usize {
        self.count(ComponentStatus::Warning)
    }

    pub fn critical_count(&self) -> usize {
        self.count(ComponentStatus::Critical)
    }

    fn count(&self, status: ComponentStatus) -> usize {
        self.components.iter().filter(|c| c.status == status).count()
    }
}

/// 检查历史记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub checked_at: DateTime<Utc>,
    pub overall: OverallStatus,
    pub warning_count: usize,
    pub critical_count: usize,
    pub check_duration: Duration,
}

/// 健康摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub current_status: OverallStatus,
    pub last_check: DateTime<Utc>,
    /// 最近检查中健康的比例（百分比）
    pub health_rate: f64,
    pub average_check_duration: Duration,
    pub recent_warnings: usize,
    pub recent_criticals: usize,
    /// 参与统计的检查次数
    pub sample_size: usize,
}

/// 自愈动作结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealOutcome {
    pub component: HealthComponent,
    pub success: bool,
    pub detail: String,
}

/// 健康检查参数
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub storage_paths: Vec<PathBuf>,
    /// 活跃任务卡死阈值
    pub stuck_threshold: Duration,
    pub stats_retention_days: u32,
    pub ping_timeout: Duration,
}

impl HealthSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            storage_paths: config.storage_paths.clone(),
            stuck_threshold: config.stuck_task_threshold(),
            stats_retention_days: config.stats_retention_days,
            ping_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// 健康监控器
pub struct HealthMonitor {
    queue: Arc<TaskQueue>,
    stats: Arc<StatisticsCollector>,
    settings: HealthSettings,
    clients: Vec<Arc<dyn UpstreamClient>>,
    cleanup: Option<Arc<dyn CleanupSweep>>,
    notifier: Arc<dyn NotificationSink>,
    history: Mutex<VecDeque<HealthRecord>>,
}

impl HealthMonitor {
    pub fn new(
        queue: Arc<TaskQueue>,
        stats: Arc<StatisticsCollector>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            queue,
            stats,
            settings,
            clients: Vec::new(),
            cleanup: None,
            notifier: Arc::new(LogNotifier),
            history: Mutex::new(VecDeque::with_capacity(HEALTH_HISTORY_CAPACITY)),
        }
    }

    pub fn with_clients(mut self, clients: Vec<Arc<dyn UpstreamClient>>) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_cleanup(mut self, cleanup: Arc<dyn CleanupSweep>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// 执行一次完整检查并记入历史
    pub async fn check_health(&self) -> HealthReport {
        let start = Instant::now();
        let checked_at = Utc::now();

        let components = vec![
            self.check_queue(),
            self.check_storage().await,
            self.check_clients().await,
            self.check_statistics(),
        ];

        let overall = if components
            .iter()
            .all(|c| c.status == ComponentStatus::Healthy)
        {
            OverallStatus::Healthy
        } else {
            OverallStatus::Unhealthy
        };

        let report = HealthReport {
            checked_at,
            overall,
            components,
            check_duration: start.elapsed(),
        };
        self.record(&report);

        debug!(
            "健康检查完成: {:?}, 警告 {}, 严重 {}, 耗时 {:.2?}",
            report.overall,
            report.warning_count(),
            report.critical_count(),
            report.check_duration
        );
        report
    }

    /// 队列存活：有就绪任务却没有任何执行中的任务
    pub fn check_queue(&self) -> ComponentCheck {
        let snapshot = self.queue.snapshot();
        let ready = self.queue.ready_count();
        if snapshot.active == 0 && ready > 0 {
            ComponentCheck::new(
                HealthComponent::Queue,
                ComponentStatus::Warning,
                format!("有 {} 个就绪任务等待，但没有执行中的任务", ready),
            )
        } else {
            ComponentCheck::new(
                HealthComponent::Queue,
                ComponentStatus::Healthy,
                format!(
                    "等待 {}，执行中 {}/{}",
                    snapshot.queued, snapshot.active, snapshot.max_concurrent
                ),
            )
        }
    }

    /// 存储：路径存在且磁盘使用率在阈值内，多个路径取最差结果
    ///
    /// 路径检查和磁盘枚举在阻塞线程池中执行
    pub async fn check_storage(&self) -> ComponentCheck {
        if self.settings.storage_paths.is_empty() {
            return ComponentCheck::new(
                HealthComponent::Storage,
                ComponentStatus::Healthy,
                "未配置存储路径",
            );
        }

        let paths = self.settings.storage_paths.clone();
        match tokio::task::spawn_blocking(move || evaluate_storage(&paths)).await {
            Ok(check) => check,
            Err(e) => {
                error!("存储检查任务异常: {}", e);
                ComponentCheck::new(
                    HealthComponent::Storage,
                    ComponentStatus::Warning,
                    format!("存储检查失败: {}", e),
                )
            }
        }
    }

    /// 上游客户端：全部响应为健康，部分响应为警告，全部无响应为严重
    pub async fn check_clients(&self) -> ComponentCheck {
        if self.clients.is_empty() {
            return ComponentCheck::new(
                HealthComponent::Client,
                ComponentStatus::Healthy,
                "未配置上游客户端",
            );
        }

        let mut failed = Vec::new();
        for client in &self.clients {
            let result = tokio::time::timeout(self.settings.ping_timeout, client.ping()).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("客户端 {} 无响应: {}", client.name(), e);
                    failed.push(client.name().to_string());
                }
                Err(_) => {
                    debug!("客户端 {} 响应超时", client.name());
                    failed.push(client.name().to_string());
                }
            }
        }

        let total = self.clients.len();
        let responding = total - failed.len();
        let status = if responding == total {
            ComponentStatus::Healthy
        } else if responding > 0 {
            ComponentStatus::Warning
        } else {
            ComponentStatus::Critical
        };
        let message = if failed.is_empty() {
            format!("{}/{} 个客户端响应正常", responding, total)
        } else {
            format!(
                "{}/{} 个客户端响应正常，无响应: {}",
                responding,
                total,
                failed.join(", ")
            )
        };
        ComponentCheck::new(HealthComponent::Client, status, message)
    }

    /// 统计新鲜度：最近记录日期应为今天
    pub fn check_statistics(&self) -> ComponentCheck {
        self.check_statistics_at(Local::now().date_naive())
    }

    pub fn check_statistics_at(&self, today: NaiveDate) -> ComponentCheck {
        let today = today.format("%Y-%m-%d").to_string();
        match self.stats.latest_day() {
            None => ComponentCheck::new(
                HealthComponent::Statistics,
                ComponentStatus::Healthy,
                "暂无统计数据",
            ),
            Some(day) if day == today => ComponentCheck::new(
                HealthComponent::Statistics,
                ComponentStatus::Healthy,
                "统计数据已更新",
            ),
            Some(day) => ComponentCheck::new(
                HealthComponent::Statistics,
                ComponentStatus::Warning,
                format!("统计数据未更新，最近记录日期: {}", day),
            ),
        }
    }

    /// 自愈：仅在整体不健康时执行，每个失败组件一个动作
    pub async fn self_heal(&self, report: &HealthReport) -> Vec<HealOutcome> {
        if report.is_healthy() {
            return Vec::new();
        }

        let mut outcomes = Vec::new();
        for check in report.failed() {
            match check.component {
                HealthComponent::Queue => {
                    let purged = self.queue.purge_stuck(self.settings.stuck_threshold);
                    for task in &purged {
                        warn!("清理卡死任务: id={}, source={}", task.id, task.source_path);
                    }
                    outcomes.push(HealOutcome {
                        component: HealthComponent::Queue,
                        success: true,
                        detail: format!("清理 {} 个卡死任务", purged.len()),
                    });
                }
                HealthComponent::Client => {
                    for client in &self.clients {
                        let outcome = match client.reconnect().await {
                            Ok(()) => {
                                info!("客户端 {} 重新连接成功", client.name());
                                HealOutcome {
                                    component: HealthComponent::Client,
                                    success: true,
                                    detail: format!("{} 重新连接成功", client.name()),
                                }
                            }
                            Err(e) => {
                                error!("客户端 {} 重新连接失败: {}", client.name(), e);
                                HealOutcome {
                                    component: HealthComponent::Client,
                                    success: false,
                                    detail: format!("{} 重新连接失败: {}", client.name(), e),
                                }
                            }
                        };
                        outcomes.push(outcome);
                    }
                }
                HealthComponent::Storage => {
                    if let Some(cleanup) = &self.cleanup {
                        let outcome = match cleanup.sweep().await {
                            Ok(n) => HealOutcome {
                                component: HealthComponent::Storage,
                                success: true,
                                detail: format!("存储清理完成: {} 条", n),
                            },
                            Err(e) => {
                                error!("存储清理失败: {:#}", e);
                                HealOutcome {
                                    component: HealthComponent::Storage,
                                    success: false,
                                    detail: format!("存储清理失败: {}", e),
                                }
                            }
                        };
                        outcomes.push(outcome);
                    }
                    let removed = self.stats.cleanup_old_data(self.settings.stats_retention_days);
                    outcomes.push(HealOutcome {
                        component: HealthComponent::Storage,
                        success: true,
                        detail: format!("清理 {} 个过期统计桶", removed),
                    });
                }
                HealthComponent::Statistics => {}
            }
        }

        for outcome in &outcomes {
            info!("自愈动作 [{}]: {}", outcome.component, outcome.detail);
        }
        outcomes
    }

    fn record(&self, report: &HealthReport) {
        let mut history = self.history.lock();
        history.push_back(HealthRecord {
            checked_at: report.checked_at,
            overall: report.overall,
            warning_count: report.warning_count(),
            critical_count: report.critical_count(),
            check_duration: report.check_duration,
        });
        while history.len() > HEALTH_HISTORY_CAPACITY {
            history.pop_front();
        }
    }

    pub fn history(&self) -> Vec<HealthRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// 最近检查的摘要，无记录时为 None
    pub fn summary(&self) -> Option<HealthSummary> {
        let history = self.history.lock();
        let latest = history.back()?;
        let recent: Vec<&HealthRecord> = history.iter().rev().take(SUMMARY_WINDOW).collect();
        let n = recent.len();

        let healthy = recent
            .iter()
            .filter(|r| r.overall == OverallStatus::Healthy)
            .count();
        let total_duration: Duration = recent.iter().map(|r| r.check_duration).sum();

        Some(HealthSummary {
            current_status: latest.overall,
            last_check: latest.checked_at,
            health_rate: healthy as f64 / n as f64 * 100.0,
            average_check_duration: total_duration / n as u32,
            recent_warnings: recent.iter().map(|r| r.warning_count).sum(),
            recent_criticals: recent.iter().map(|r| r.critical_count).sum(),
            sample_size: n,
        })
    }

    /// 执行一次检查：告警、性能告警、自愈
    pub async fn check_and_heal(&self) -> HealthReport {
        let report = self.check_health().await;

        if !report.is_healthy() {
            let details: Vec<String> = report
                .failed()
                .map(|c| format!("[{}] {}", c.component, c.message))
                .collect();
            warn!("健康检查发现问题: {}", details.join("; "));
            send_notification(self.notifier.as_ref(), "健康检查告警", &details.join("\n"));
            self.self_heal(&report).await;
        }

        let alerts = self.stats.performance_alerts(PERFORMANCE_ALERT_MIN_SAMPLES);
        if !alerts.is_empty() {
            warn!("性能告警: {}", alerts.join("; "));
            send_notification(self.notifier.as_ref(), "性能告警", &alerts.join("\n"));
        }

        report
    }

    /// 周期检查循环
    pub async fn run(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        info!("健康检查已启动，间隔 {:?}", interval);
        let mut ticker = tokio::time::interval(interval);
        // 第一次 tick 立即完成，启动时不做检查
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_and_heal().await;
                }
            }
        }
        info!("健康检查已停止");
    }
}

fn evaluate_storage(paths: &[PathBuf]) -> ComponentCheck {
    let mut worst = ComponentStatus::Healthy;
    let mut messages = Vec::new();
    for path in paths {
        if !path.exists() {
            worst = worst.max(ComponentStatus::Critical);
            messages.push(format!("路径不存在: {}", path.display()));
            continue;
        }

        match disk_usage_percent(path) {
            Some(percent) => {
                let status = classify_usage(percent);
                worst = worst.max(status);
                if status != ComponentStatus::Healthy {
                    messages.push(format!("磁盘使用率 {:.1}%: {}", percent, path.display()));
                }
            }
            None => {
                debug!("无法获取磁盘使用率: {}", path.display());
            }
        }
    }

    let message = if messages.is_empty() {
        format!("{} 个存储路径正常", paths.len())
    } else {
        messages.join("; ")
    };
    ComponentCheck::new(HealthComponent::Storage, worst, message)
}
