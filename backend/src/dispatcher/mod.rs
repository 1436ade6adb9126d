//! 任务分发循环
//!
//! 每一轮（tick）尽可能多地从队列取出就绪任务，每个任务派生一个执行单元。
//! 执行单元根据结果路由：成功 -> 完成；不可重试 -> 失败；可重试 -> 重新入队或耗尽后失败。
//!
//! ```text
//! [interval] ─┐
//! [enqueue]  ─┼── tick() ──► next_ready() ──► spawn(execute) ──► route outcome
//! [retry]    ─┘   (ticking 防重入)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::notify::{send_notification, CompletedTransfer, DownstreamTrigger, LogNotifier, NotificationSink};
use crate::operation::TransferOperation;
use crate::persistence::QueueJournal;
use crate::queue::{RetryOutcome, TaskQueue, TransferTask};
use crate::retry::{BackoffPolicy, ErrorClassifier};

/// 分发参数
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// 最大尝试次数
    pub max_attempts: u32,
    /// 退避策略
    pub backoff: BackoffPolicy,
    /// 轮询间隔
    pub tick_interval: Duration,
    /// 成功时是否通知
    pub notify_on_success: bool,
}

impl DispatchSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_attempts: config.max_retry_attempts,
            backoff: config.backoff_policy(),
            tick_interval: config.queue_check_interval(),
            notify_on_success: config.notify_on_success,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// 活跃守卫：执行单元结束（包括 panic）时从活跃集合移除
struct ActiveGuard {
    queue: Arc<TaskQueue>,
    task_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.queue.release(&self.task_id);
    }
}

/// 任务分发器
pub struct Dispatcher<O: TransferOperation> {
    queue: Arc<TaskQueue>,
    operation: O,
    classifier: ErrorClassifier,
    settings: DispatchSettings,
    notifier: Arc<dyn NotificationSink>,
    downstream: Option<Arc<dyn DownstreamTrigger>>,
    journal: Option<QueueJournal>,
    /// 防重入：上一轮未结束时新的 tick 直接跳过
    ticking: AtomicBool,
    wake: Notify,
    cancel: CancellationToken,
}

impl<O: TransferOperation> Dispatcher<O> {
    pub fn new(queue: Arc<TaskQueue>, operation: O, settings: DispatchSettings) -> Self {
        Self {
            queue,
            operation,
            classifier: ErrorClassifier::default(),
            settings,
            notifier: Arc::new(LogNotifier),
            downstream: None,
            journal: None,
            ticking: AtomicBool::new(false),
            wake: Notify::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_downstream(mut self, downstream: Arc<dyn DownstreamTrigger>) -> Self {
        self.downstream = Some(downstream);
        self
    }

    pub fn with_journal(mut self, journal: QueueJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// 执行一轮分发
    ///
    /// 返回本轮派生的执行单元句柄；上一轮未结束或已关闭时返回空
    pub fn tick(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if self.cancel.is_cancelled() {
            return Vec::new();
        }

        if self.ticking.swap(true, Ordering::AcqRel) {
            debug!("上一轮分发尚未结束，跳过本轮");
            return Vec::new();
        }

        let mut handles = Vec::new();
        while let Some(task) = self.queue.next_ready() {
            debug!(
                "分发任务: id={}, source={}, priority={:?}, retry_count={}",
                task.id, task.source_path, task.priority, task.retry_count
            );
            let this = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                this.execute(task).await;
            }));
        }

        self.ticking.store(false, Ordering::Release);
        handles
    }

    /// 唤醒分发循环（入队后调用）
    pub fn trigger(&self) {
        if !self.cancel.is_cancelled() {
            self.wake.notify_one();
        }
    }

    /// 停止分发循环，执行中的任务收到取消信号
    pub fn shutdown(&self) {
        info!("分发器关闭");
        self.cancel.cancel();
        self.wake.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 分发主循环
    pub async fn run(self: Arc<Self>) {
        info!(
            "分发循环已启动，检查间隔 {:?}，最大并发 {}",
            self.settings.tick_interval,
            self.queue.max_concurrent()
        );

        let mut ticker = tokio::time::interval(self.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }

            let spawned = self.tick();
            if !spawned.is_empty() {
                debug!("本轮分发 {} 个任务", spawned.len());
            }
            self.save_journal().await;
        }

        self.save_journal().await;
        info!("分发循环已退出");
    }

    async fn save_journal(&self) {
        if let Some(journal) = &self.journal {
            let journal = journal.clone();
            let queue = self.queue.clone();
            match tokio::task::spawn_blocking(move || journal.save(&queue)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("保存队列日志失败: {}", e),
                Err(e) => error!("保存队列日志任务异常: {}", e),
            }
        }
    }

    /// 执行单元
    async fn execute(self: Arc<Self>, mut task: TransferTask) {
        let guard = ActiveGuard {
            queue: self.queue.clone(),
            task_id: task.id.clone(),
        };

        let result = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => None,
            r = self.operation.execute(&task, self.cancel.child_token()) => Some(r),
        };

        let wake = match result {
            Some(Ok(bytes)) => {
                self.on_success(&task, bytes).await;
                false
            }
            // 关闭引起的中断不算失败，原样放回等待队列
            Some(Err(_)) | None if self.cancel.is_cancelled() => {
                self.on_interrupted(&task);
                false
            }
            Some(Err(e)) => self.on_failure(&mut task, e),
            None => false,
        };

        // 先离开活跃集合再唤醒，重新入队的任务才能在下一轮被取到
        drop(guard);
        if wake {
            self.trigger();
        }
    }

    fn on_interrupted(&self, task: &TransferTask) {
        if self.queue.requeue(task) {
            info!("分发器关闭，任务放回等待队列: {}", task.source_path);
        } else {
            warn!(
                "任务 {} 已不在活跃集合中（可能已被清理），不再放回: {}",
                task.id, task.source_path
            );
        }
    }

    fn discard_outcome(task: &TransferTask) {
        warn!(
            "任务 {} 已不在活跃集合中（可能已被清理），丢弃执行结果: {}",
            task.id, task.source_path
        );
    }

    async fn on_success(&self, task: &TransferTask, bytes: u64) {
        if !self.queue.mark_completed(task, true) {
            Self::discard_outcome(task);
            return;
        }
        info!(
            "上传成功: {} -> {} ({} 字节, 重试 {} 次)",
            task.source_path, task.dest_path, bytes, task.retry_count
        );

        if let Some(journal) = &self.journal {
            let journal = journal.clone();
            let source_path = task.source_path.clone();
            match tokio::task::spawn_blocking(move || journal.mark_processed(&source_path)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("记录已处理路径失败: {}, error={}", task.source_path, e),
                Err(e) => error!("记录已处理路径任务异常: {}, error={}", task.source_path, e),
            }
        }

        if self.settings.notify_on_success {
            send_notification(
                self.notifier.as_ref(),
                "上传成功",
                &format!("{}\n-> {}", task.source_path, task.dest_path),
            );
        }

        if let Some(downstream) = &self.downstream {
            downstream.on_completed(CompletedTransfer::from(task));
        }
    }

    /// 失败路由，返回是否需要唤醒分发循环
    fn on_failure(&self, task: &mut TransferTask, err: anyhow::Error) -> bool {
        let message = format!("{:#}", err);
        let kind = self.classifier.classify(&message);
        task.record_error(message.clone(), kind);

        if !kind.is_retryable() {
            if !self.queue.mark_completed(task, false) {
                Self::discard_outcome(task);
                return false;
            }
            error!(
                "上传失败（{}，不重试）: {}, error={}",
                kind.label(),
                task.source_path,
                message
            );
            send_notification(
                self.notifier.as_ref(),
                "上传失败",
                &format!("{}\n错误类型: {}\n{}", task.source_path, kind.label(), message),
            );
            return false;
        }

        match self
            .queue
            .retry_in_flight(task, self.settings.max_attempts, &self.settings.backoff)
        {
            None => {
                Self::discard_outcome(task);
                false
            }
            Some(RetryOutcome::Scheduled { delay, .. }) => {
                warn!(
                    "上传失败（{}）: {}, {:.1?} 后进行第 {} 次重试, error={}",
                    kind.label(),
                    task.source_path,
                    delay,
                    task.retry_count,
                    message
                );
                true
            }
            Some(RetryOutcome::Exhausted) => {
                if !self.queue.mark_completed(task, false) {
                    Self::discard_outcome(task);
                    return false;
                }
                error!(
                    "上传失败，已重试 {} 次仍未成功: {}, error={}",
                    task.retry_count, task.source_path, message
                );
                send_notification(
                    self.notifier.as_ref(),
                    "上传重试失败",
                    &format!(
                        "{}\n已重试 {} 次\n最后错误: {}",
                        task.source_path, task.retry_count, message
                    ),
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::Notification;
    use crate::persistence::MemoryStore;
    use crate::queue::{TaskPriority, TaskState};
    use crate::retry::ErrorKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    /// 按调用序号返回结果的脚本化操作
    struct Scripted<F> {
        calls: Mutex<Vec<String>>,
        count: AtomicUsize,
        respond: F,
    }

    impl<F> Scripted<F> {
        fn new(respond: F) -> Arc<Self>
        where
            F: Fn(&TransferTask, usize) -> anyhow::Result<u64> + Send + Sync + 'static,
        {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                count: AtomicUsize::new(0),
                respond,
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl<F> TransferOperation for Scripted<F>
    where
        F: Fn(&TransferTask, usize) -> anyhow::Result<u64> + Send + Sync + 'static,
    {
        async fn execute(
            &self,
            task: &TransferTask,
            _cancel: CancellationToken,
        ) -> anyhow::Result<u64> {
            self.calls.lock().push(task.source_path.clone());
            let n = self.count.fetch_add(1, Ordering::SeqCst);
            (self.respond)(task, n)
        }
    }

    fn settings(max_attempts: u32) -> DispatchSettings {
        DispatchSettings {
            max_attempts,
            backoff: BackoffPolicy::new(Duration::ZERO, Duration::ZERO, false),
            tick_interval: Duration::from_millis(10),
            notify_on_success: false,
        }
    }

    async fn run_tick<O: TransferOperation>(dispatcher: &Arc<Dispatcher<O>>) -> usize {
        let handles = dispatcher.tick();
        let n = handles.len();
        for handle in handles {
            handle.await.unwrap();
        }
        n
    }

    #[tokio::test]
    async fn test_dispatch_order_single_slot() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        let base = chrono::Utc::now();
        for (i, (path, priority)) in [
            ("/low", TaskPriority::Low),
            ("/high", TaskPriority::High),
            ("/normal", TaskPriority::Normal),
        ]
        .into_iter()
        .enumerate()
        {
            queue.add(
                TransferTask::with_priority(path, "/d", priority)
                    .created_at(base + chrono::Duration::milliseconds(i as i64)),
            );
        }

        let op = Scripted::new(|_, _| Ok(1));
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), op.clone(), settings(5)));

        for _ in 0..3 {
            assert_eq!(run_tick(&dispatcher).await, 1);
        }
        assert_eq!(op.calls(), vec!["/high", "/normal", "/low"]);
        assert_eq!(queue.snapshot().total_success, 3);
    }

    #[tokio::test]
    async fn test_tick_fills_free_slots() {
        let queue = Arc::new(TaskQueue::new(2).unwrap());
        for i in 0..5 {
            queue.add(TransferTask::new(format!("/f{}", i), "/d"));
        }
        let op = Scripted::new(|_, _| Ok(1));
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), op, settings(5)));

        assert_eq!(run_tick(&dispatcher).await, 2);
        assert_eq!(run_tick(&dispatcher).await, 2);
        assert_eq!(run_tick(&dispatcher).await, 1);
        assert_eq!(run_tick(&dispatcher).await, 0);
    }

    #[tokio::test]
    async fn test_success_fires_downstream_and_notification() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::new("/strm/a.mkv", "/cloud/a.mkv"));
        let (note_tx, mut note_rx) = mpsc::unbounded_channel::<Notification>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<CompletedTransfer>();

        let mut s = settings(5);
        s.notify_on_success = true;
        let dispatcher = Arc::new(
            Dispatcher::new(queue.clone(), Scripted::new(|_, _| Ok(10)), s)
                .with_notifier(Arc::new(note_tx))
                .with_downstream(Arc::new(done_tx)),
        );
        run_tick(&dispatcher).await;

        let event = done_rx.try_recv().unwrap();
        assert_eq!(event.source_path, "/strm/a.mkv");
        assert_eq!(event.dest_path, "/cloud/a.mkv");
        assert_eq!(note_rx.try_recv().unwrap().title, "上传成功");
        let snap = queue.snapshot();
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.active, 0);
    }

    #[tokio::test]
    async fn test_success_notification_off_by_default() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::new("/a", "/d"));
        let (note_tx, mut note_rx) = mpsc::unbounded_channel::<Notification>();
        let dispatcher = Arc::new(
            Dispatcher::new(queue, Scripted::new(|_, _| Ok(1)), settings(5))
                .with_notifier(Arc::new(note_tx)),
        );
        run_tick(&dispatcher).await;
        assert!(note_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_permission_error_fails_immediately() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::new("/locked.mkv", "/d"));
        let (note_tx, mut note_rx) = mpsc::unbounded_channel::<Notification>();
        let op = Scripted::new(|_, _| Err(anyhow::anyhow!("Permission denied")));
        let dispatcher = Arc::new(
            Dispatcher::new(queue.clone(), op.clone(), settings(5))
                .with_notifier(Arc::new(note_tx)),
        );

        run_tick(&dispatcher).await;
        assert_eq!(run_tick(&dispatcher).await, 0);

        assert_eq!(op.calls().len(), 1);
        let failed = queue.failed_history();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].state, TaskState::Failed);
        assert_eq!(failed[0].retry_count, 0);
        assert!(failed[0].next_retry_at.is_none());
        assert_eq!(failed[0].last_error_kind, Some(ErrorKind::Permission));
        assert_eq!(note_rx.try_recv().unwrap().title, "上传失败");
    }

    #[tokio::test]
    async fn test_file_not_found_not_retried_despite_attempts_left() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::new("/gone.mkv", "/d"));
        let op = Scripted::new(|_, _| Err(anyhow::anyhow!("No such file or directory")));
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), op.clone(), settings(100)));

        run_tick(&dispatcher).await;
        run_tick(&dispatcher).await;

        assert_eq!(op.calls().len(), 1);
        assert_eq!(queue.snapshot().failed, 1);
        assert_eq!(queue.snapshot().queued, 0);
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::new("/flaky.mkv", "/d"));
        let (note_tx, mut note_rx) = mpsc::unbounded_channel::<Notification>();
        let op = Scripted::new(|_, _| Err(anyhow::anyhow!("connection reset by peer")));
        let dispatcher = Arc::new(
            Dispatcher::new(queue.clone(), op.clone(), settings(2))
                .with_notifier(Arc::new(note_tx)),
        );

        assert_eq!(run_tick(&dispatcher).await, 1);
        // 第一次失败后重新入队
        let queued = queue.queued_tasks();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].retry_count, 1);
        assert_eq!(queued[0].priority, TaskPriority::High);

        assert_eq!(run_tick(&dispatcher).await, 1);
        assert_eq!(run_tick(&dispatcher).await, 0);

        assert_eq!(op.calls().len(), 2);
        let failed = queue.failed_history();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 2);
        assert_eq!(failed[0].last_error_kind, Some(ErrorKind::Network));

        let note = note_rx.try_recv().unwrap();
        assert_eq!(note.title, "上传重试失败");
        assert!(note.text.contains("已重试 2 次"));
        assert!(note.text.contains("connection reset"));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::new("/a.mkv", "/d"));
        let op = Scripted::new(|_, n| {
            if n == 0 {
                Err(anyhow::anyhow!("device or resource busy"))
            } else {
                Ok(5)
            }
        });
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), op.clone(), settings(5)));

        run_tick(&dispatcher).await;
        run_tick(&dispatcher).await;

        let completed = queue.completed_history();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].retry_count, 1);
        assert_eq!(completed[0].last_error_kind, Some(ErrorKind::Temporary));
        let snap = queue.snapshot();
        assert_eq!(snap.total_success, 1);
        assert_eq!(snap.total_failed, 0);
        assert_eq!(snap.total_queued, 1);
    }

    #[tokio::test]
    async fn test_disk_full_delay_tripled() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::new("/big.mkv", "/d"));
        let op = Scripted::new(|_, _| Err(anyhow::anyhow!("No space left on device")));
        let mut s = settings(5);
        s.backoff = BackoffPolicy::new(Duration::from_secs(2), Duration::from_secs(300), false);
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), op, s));

        let before = chrono::Utc::now();
        run_tick(&dispatcher).await;
        let after = chrono::Utc::now();

        let task = queue.queued_tasks().remove(0);
        let next = task.next_retry_at.unwrap();
        assert!(next >= before + chrono::Duration::seconds(6));
        assert!(next <= after + chrono::Duration::seconds(6));
        // 未到重试时间，不会再次分发
        assert_eq!(run_tick(&dispatcher).await, 0);
    }

    #[tokio::test]
    async fn test_overlapping_tick_skipped() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::new("/a", "/d"));
        let dispatcher = Arc::new(Dispatcher::new(queue, Scripted::new(|_, _| Ok(1)), settings(5)));

        dispatcher.ticking.store(true, Ordering::SeqCst);
        assert!(dispatcher.tick().is_empty());

        dispatcher.ticking.store(false, Ordering::SeqCst);
        assert_eq!(run_tick(&dispatcher).await, 1);
    }

    struct Gated {
        gate: Arc<Notify>,
        fail: bool,
    }

    impl Gated {
        fn ok(gate: Arc<Notify>) -> Self {
            Self { gate, fail: false }
        }

        fn failing(gate: Arc<Notify>) -> Self {
            Self { gate, fail: true }
        }
    }

    #[async_trait]
    impl TransferOperation for Gated {
        async fn execute(
            &self,
            _task: &TransferTask,
            _cancel: CancellationToken,
        ) -> anyhow::Result<u64> {
            self.gate.notified().await;
            if self.fail {
                Err(anyhow::anyhow!("connection reset by peer"))
            } else {
                Ok(1)
            }
        }
    }

    #[tokio::test]
    async fn test_purged_task_outcome_dropped() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::new("/stuck.mkv", "/d"));
        let gate = Arc::new(Notify::new());
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<CompletedTransfer>();
        let dispatcher = Arc::new(
            Dispatcher::new(queue.clone(), Gated::ok(gate.clone()), settings(5))
                .with_downstream(Arc::new(done_tx)),
        );

        let handles = dispatcher.tick();
        assert_eq!(handles.len(), 1);
        let purged = queue.purge_stuck_at(Duration::ZERO, chrono::Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(purged.len(), 1);

        gate.notify_one();
        for handle in handles {
            handle.await.unwrap();
        }

        let snap = queue.snapshot();
        assert_eq!(snap.completed, 0);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.active, 0);
        assert!(done_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_purged_task_failure_not_requeued() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::new("/stuck.mkv", "/d"));
        let gate = Arc::new(Notify::new());
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            Gated::failing(gate.clone()),
            settings(5),
        ));

        let handles = dispatcher.tick();
        queue.purge_stuck_at(Duration::ZERO, chrono::Utc::now() + chrono::Duration::seconds(1));

        gate.notify_one();
        for handle in handles {
            handle.await.unwrap();
        }

        let snap = queue.snapshot();
        assert_eq!(snap.queued, 0);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.total_failed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_requeues_in_flight_task() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::new("/slow.mkv", "/d"));
        let gate = Arc::new(Notify::new());
        let dispatcher = Arc::new(Dispatcher::new(queue.clone(), Gated::ok(gate), settings(5)));

        let handles = dispatcher.tick();
        tokio::task::yield_now().await;
        dispatcher.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        let queued = queue.queued_tasks();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].retry_count, 0);
        assert!(queued[0].last_error.is_none());
        assert_eq!(queue.snapshot().active, 0);
        // 关闭后不再分发
        assert!(dispatcher.tick().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_on_last_attempt_keeps_task() {
        let queue = Arc::new(TaskQueue::new(1).unwrap());
        queue.add(TransferTask::with_priority("/slow.mkv", "/d", TaskPriority::Low));
        let journal = QueueJournal::new(Arc::new(MemoryStore::new()));
        let (note_tx, mut note_rx) = mpsc::unbounded_channel::<Notification>();
        let dispatcher = Arc::new(
            Dispatcher::new(queue.clone(), Gated::ok(Arc::new(Notify::new())), settings(1))
                .with_notifier(Arc::new(note_tx))
                .with_journal(journal.clone()),
        );

        let handles = dispatcher.tick();
        tokio::task::yield_now().await;
        dispatcher.shutdown();
        for handle in handles {
            handle.await.unwrap();
        }

        let snap = queue.snapshot();
        assert_eq!(snap.queued, 1);
        assert_eq!(snap.failed, 0);
        assert_eq!(snap.total_failed, 0);
        let task = queue.queued_tasks().remove(0);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.priority, TaskPriority::Low);
        assert!(note_rx.try_recv().is_err());

        dispatcher.save_journal().await;
        assert_eq!(journal.waiting_tasks().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_run_loop_processes_and_journals() {
        let queue = Arc::new(TaskQueue::new(2).unwrap());
        let journal = QueueJournal::new(Arc::new(MemoryStore::new()));
        let dispatcher = Arc::new(
            Dispatcher::new(queue.clone(), Scripted::new(|_, _| Ok(1)), settings(5))
                .with_journal(journal.clone()),
        );
        let runner = tokio::spawn(dispatcher.clone().run());

        queue.add(TransferTask::new("/a.mkv", "/d/a.mkv"));
        queue.add(TransferTask::new("/b.mkv", "/d/b.mkv"));
        dispatcher.trigger();

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.snapshot().total_success < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        dispatcher.shutdown();
        runner.await.unwrap();

        let processed = journal.processed_list().unwrap();
        assert!(processed.contains(&"/a.mkv".to_string()));
        assert!(processed.contains(&"/b.mkv".to_string()));
        assert!(journal.waiting_tasks().unwrap().is_empty());
    }
}
