//! 引擎
//!
//! 组合队列、分发器、统计、健康检查和队列日志，对宿主暴露一个入口。
//! 宿主既可以调用 `start()` 使用内置的定时驱动，也可以自行周期调用 `tick()`。

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::dispatcher::{DispatchSettings, Dispatcher};
use crate::error::{EngineError, EngineResult};
use crate::health::{CleanupSweep, HealthMonitor, HealthReport, HealthSettings, UpstreamClient};
use crate::notify::{DownstreamTrigger, LogNotifier, NotificationSink};
use crate::operation::{instrument, with_timeout, Instrumented, TimeoutOperation, TransferOperation};
use crate::persistence::{QueueJournal, StateStore};
use crate::queue::{QueueSnapshot, TaskPriority, TaskQueue, TransferTask};
use crate::retry::ErrorClassifier;
use crate::stats::StatisticsCollector;

/// 统计数据清理间隔
const STATS_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

type Pipeline<O> = Instrumented<TimeoutOperation<O>>;

/// 引擎构建器
pub struct EngineBuilder<O: TransferOperation> {
    config: EngineConfig,
    operation: O,
    classifier: ErrorClassifier,
    notifier: Arc<dyn NotificationSink>,
    downstream: Option<Arc<dyn DownstreamTrigger>>,
    clients: Vec<Arc<dyn UpstreamClient>>,
    cleanup: Option<Arc<dyn CleanupSweep>>,
    store: Option<Arc<dyn StateStore>>,
}

impl<O: TransferOperation> EngineBuilder<O> {
    pub fn classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn downstream(mut self, downstream: Arc<dyn DownstreamTrigger>) -> Self {
        self.downstream = Some(downstream);
        self
    }

    pub fn client(mut self, client: Arc<dyn UpstreamClient>) -> Self {
        self.clients.push(client);
        self
    }

    pub fn cleanup(mut self, cleanup: Arc<dyn CleanupSweep>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    /// 启用队列日志
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> EngineResult<Engine<O>> {
        self.config.validate()?;

        let queue = Arc::new(TaskQueue::new(self.config.max_concurrent_uploads)?);
        let stats = Arc::new(StatisticsCollector::new());
        let journal = self.store.map(QueueJournal::new);

        let pipeline = instrument(
            with_timeout(self.operation, self.config.operation_timeout()),
            stats.clone(),
            self.classifier.clone(),
        );

        let mut dispatcher = Dispatcher::new(
            queue.clone(),
            pipeline,
            DispatchSettings::from_config(&self.config),
        )
        .with_classifier(self.classifier)
        .with_notifier(self.notifier.clone());
        if let Some(downstream) = self.downstream {
            dispatcher = dispatcher.with_downstream(downstream);
        }
        if let Some(journal) = &journal {
            dispatcher = dispatcher.with_journal(journal.clone());
        }

        let mut health = HealthMonitor::new(
            queue.clone(),
            stats.clone(),
            HealthSettings::from_config(&self.config),
        )
        .with_clients(self.clients)
        .with_notifier(self.notifier);
        // 未指定清理动作时，用已处理列表清理代替
        let cleanup = self.cleanup.or_else(|| {
            journal
                .clone()
                .map(|j| Arc::new(j) as Arc<dyn CleanupSweep>)
        });
        if let Some(cleanup) = cleanup {
            health = health.with_cleanup(cleanup);
        }

        info!(
            "传输引擎已创建: 最大并发 {}, 最大尝试 {}, 退避 {}s..{}s, 抖动 {}",
            self.config.max_concurrent_uploads,
            self.config.max_retry_attempts,
            self.config.retry_base_delay_seconds,
            self.config.retry_max_delay_seconds,
            self.config.enable_jitter
        );

        Ok(Engine {
            config: self.config,
            queue,
            stats,
            dispatcher: Arc::new(dispatcher),
            health: Arc::new(health),
            journal,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// 传输引擎
pub struct Engine<O: TransferOperation> {
    config: EngineConfig,
    queue: Arc<TaskQueue>,
    stats: Arc<StatisticsCollector>,
    dispatcher: Arc<Dispatcher<Pipeline<O>>>,
    health: Arc<HealthMonitor>,
    journal: Option<QueueJournal>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<O: TransferOperation> Engine<O> {
    pub fn builder(config: EngineConfig, operation: O) -> EngineBuilder<O> {
        EngineBuilder {
            config,
            operation,
            classifier: ErrorClassifier::default(),
            notifier: Arc::new(LogNotifier),
            downstream: None,
            clients: Vec::new(),
            cleanup: None,
            store: None,
        }
    }

    /// 使用默认协作者创建引擎
    pub fn new(config: EngineConfig, operation: O) -> EngineResult<Self> {
        Self::builder(config, operation).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn stats(&self) -> &Arc<StatisticsCollector> {
        &self.stats
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// 入队并唤醒分发循环，返回任务 ID
    pub fn enqueue(&self, task: TransferTask) -> String {
        let id = task.id.clone();
        info!(
            "新任务入队: {} -> {} (优先级 {:?})",
            task.source_path, task.dest_path, task.priority
        );
        self.queue.add(task);
        self.dispatcher.trigger();
        id
    }

    pub fn submit(
        &self,
        source_path: impl Into<String>,
        dest_path: impl Into<String>,
        priority: TaskPriority,
    ) -> String {
        self.enqueue(TransferTask::with_priority(source_path, dest_path, priority))
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub fn set_max_concurrent(&self, max: usize) -> EngineResult<()> {
        self.queue.set_max_concurrent(max)?;
        self.dispatcher.trigger();
        Ok(())
    }

    /// 手动执行一轮分发（宿主自行驱动时使用）
    pub fn tick(&self) -> Vec<JoinHandle<()>> {
        self.dispatcher.tick()
    }

    pub async fn check_health(&self) -> HealthReport {
        self.health.check_and_heal().await
    }

    /// 从队列日志恢复未完成任务
    pub fn restore(&self) -> EngineResult<usize> {
        match &self.journal {
            Some(journal) => {
                let count = journal.restore(&self.queue)?;
                if count > 0 {
                    self.dispatcher.trigger();
                }
                Ok(count)
            }
            None => Ok(0),
        }
    }

    /// 立即保存队列日志
    pub fn persist(&self) -> EngineResult<usize> {
        match &self.journal {
            Some(journal) => journal.save(&self.queue),
            None => Err(EngineError::Persistence("未配置状态存储".to_string())),
        }
    }

    /// 启动分发循环、健康检查和统计清理
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("传输引擎已启动，忽略重复启动");
            return;
        }

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(self.dispatcher.clone().run()));
        handles.push(tokio::spawn(
            self.health
                .clone()
                .run(self.config.health_check_interval(), self.cancel.child_token()),
        ));

        let stats = self.stats.clone();
        let retention = self.config.stats_retention_days;
        let cancel = self.cancel.child_token();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_CLEANUP_INTERVAL);
            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        stats.cleanup_old_data(retention);
                    }
                }
            }
        }));

        info!("传输引擎已启动");
    }

    /// 等待队列清空（没有等待中和执行中的任务）
    pub async fn wait_idle(&self, poll: Duration) {
        loop {
            let snapshot = self.queue.snapshot();
            if snapshot.queued == 0 && snapshot.active == 0 {
                return;
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// 停止所有后台循环并等待退出
    pub async fn shutdown(&self) {
        info!("正在关闭传输引擎...");
        self.dispatcher.shutdown();
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("后台任务退出异常: {}", e);
            }
        }
        info!("传输引擎已关闭");
    }
}
