//! 队列日志
//!
//! 在键值存储中维护两个列表：
//! - `waiting_process_list`：尚未完成的任务（等待中 + 执行中），重启后重新入队
//! - `processed_list`：已成功处理的源路径，最多保留 1000 条

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::store::StateStore;
use crate::error::EngineResult;
use crate::queue::{TaskQueue, TaskState, TransferTask};

pub const WAITING_LIST_KEY: &str = "waiting_process_list";
pub const PROCESSED_LIST_KEY: &str = "processed_list";
/// 已处理列表保留数量
pub const PROCESSED_LIST_CAPACITY: usize = 1000;

/// 队列日志
#[derive(Clone)]
pub struct QueueJournal {
    store: Arc<dyn StateStore>,
    /// 已处理列表的读-改-写需串行，避免并发完成时互相覆盖
    processed_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for QueueJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueJournal").finish_non_exhaustive()
    }
}

impl QueueJournal {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            processed_lock: Arc::new(Mutex::new(())),
        }
    }

    /// 保存未完成任务（等待中 + 执行中）
    pub fn save(&self, queue: &TaskQueue) -> EngineResult<usize> {
        let waiting = queue.unfinished_tasks();
        let count = waiting.len();
        self.store
            .set(WAITING_LIST_KEY, serde_json::to_value(&waiting)?)?;
        Ok(count)
    }

    /// 读取未完成任务，格式错误的条目跳过
    pub fn waiting_tasks(&self) -> EngineResult<Vec<TransferTask>> {
        let items = match self.store.get(WAITING_LIST_KEY)? {
            Some(Value::Array(items)) => items,
            Some(_) => {
                warn!("{} 不是数组，忽略", WAITING_LIST_KEY);
                return Ok(Vec::new());
            }
            None => return Ok(Vec::new()),
        };

        let mut tasks = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<TransferTask>(item) {
                Ok(task) => tasks.push(task),
                Err(e) => warn!("跳过无法解析的待处理任务: {}", e),
            }
        }
        Ok(tasks)
    }

    /// 启动时恢复未完成任务，返回恢复数量
    ///
    /// 执行中的任务按等待中恢复；保留重试次数、优先级和下次重试时间
    pub fn restore(&self, queue: &TaskQueue) -> EngineResult<usize> {
        let tasks = self.waiting_tasks()?;
        let count = tasks.len();
        for mut task in tasks {
            task.state = TaskState::Queued;
            queue.add(task);
        }
        if count > 0 {
            info!("从队列日志恢复 {} 个未完成任务", count);
        }
        Ok(count)
    }

    /// 记录已处理的源路径
    pub fn mark_processed(&self, source_path: &str) -> EngineResult<()> {
        let _guard = self.processed_lock.lock();
        let mut list = self.processed_list()?;
        list.retain(|p| p != source_path);
        list.push(source_path.to_string());
        if list.len() > PROCESSED_LIST_CAPACITY {
            let excess = list.len() - PROCESSED_LIST_CAPACITY;
            list.drain(..excess);
        }
        self.store.set(PROCESSED_LIST_KEY, serde_json::to_value(list)?)
    }

    pub fn processed_list(&self) -> EngineResult<Vec<String>> {
        match self.store.get(PROCESSED_LIST_KEY)? {
            Some(value) => Ok(serde_json::from_value(value).unwrap_or_else(|e| {
                warn!("{} 格式错误，重置: {}", PROCESSED_LIST_KEY, e);
                Vec::new()
            })),
            None => Ok(Vec::new()),
        }
    }

    pub fn is_processed(&self, source_path: &str) -> EngineResult<bool> {
        Ok(self.processed_list()?.iter().any(|p| p == source_path))
    }

    /// 清理已处理列表中源路径已不存在的记录（软链接本身也算存在）
    ///
    /// 文件系统检查在锁外进行，写回时只移除检查到不存在的路径
    pub fn prune_processed(&self) -> EngineResult<usize> {
        let missing: HashSet<String> = self
            .processed_list()?
            .into_iter()
            .filter(|p| {
                let exists = std::fs::symlink_metadata(Path::new(p)).is_ok();
                if !exists {
                    debug!("源路径不存在，移出已处理列表: {}", p);
                }
                !exists
            })
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let _guard = self.processed_lock.lock();
        let mut list = self.processed_list()?;
        let before = list.len();
        list.retain(|p| !missing.contains(p));
        let removed = before - list.len();
        if removed > 0 {
            self.store
                .set(PROCESSED_LIST_KEY, serde_json::to_value(list)?)?;
            info!("已处理列表清理完成: 移除 {} 条", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{JsonFileStore, MemoryStore};
    use crate::queue::TaskPriority;

    fn journal() -> QueueJournal {
        QueueJournal::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_save_and_restore() {
        let journal = journal();
        let queue = TaskQueue::new(1).unwrap();
        queue.add(TransferTask::with_priority("/a.mkv", "/d/a.mkv", TaskPriority::Low));
        queue.add(TransferTask::new("/b.mkv", "/d/b.mkv"));
        let active = queue.next_ready().unwrap();
        assert_eq!(active.source_path, "/b.mkv");

        assert_eq!(journal.save(&queue).unwrap(), 2);

        let restored = TaskQueue::new(3).unwrap();
        assert_eq!(journal.restore(&restored).unwrap(), 2);
        let snap = restored.snapshot();
        assert_eq!(snap.queued, 2);
        assert_eq!(snap.active, 0);

        // 执行中的任务恢复为等待中，仍按优先级调度
        let first = restored.next_ready().unwrap();
        assert_eq!(first.id, active.id);
        assert_eq!(first.state, TaskState::Active);
    }

    #[test]
    fn test_restore_preserves_retry_state() {
        let journal = journal();
        let queue = TaskQueue::new(1).unwrap();
        let mut task = TransferTask::new("/a.mkv", "/d/a.mkv");
        task.retry_count = 3;
        task.priority = TaskPriority::High;
        queue.add(task);
        journal.save(&queue).unwrap();

        let restored = TaskQueue::new(1).unwrap();
        journal.restore(&restored).unwrap();
        let task = restored.queued_tasks().remove(0);
        assert_eq!(task.retry_count, 3);
        assert_eq!(task.priority, TaskPriority::High);
    }

    #[test]
    fn test_retried_task_saved_once() {
        let journal = journal();
        let queue = TaskQueue::new(2).unwrap();
        queue.add(TransferTask::new("/a.mkv", "/d/a.mkv"));
        let mut task = queue.next_ready().unwrap();

        // 已重新入队，但执行单元尚未释放活跃集合
        queue.retry(&mut task, 5, &crate::retry::BackoffPolicy::default());
        assert!(queue.is_active(&task.id));

        assert_eq!(journal.save(&queue).unwrap(), 1);
        let saved = journal.waiting_tasks().unwrap();
        assert_eq!(saved[0].retry_count, 1);

        let restored = TaskQueue::new(2).unwrap();
        assert_eq!(journal.restore(&restored).unwrap(), 1);
        assert_eq!(restored.snapshot().queued, 1);
    }

    #[test]
    fn test_concurrent_mark_processed_keeps_all_entries() {
        let journal = journal();
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let journal = journal.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        journal.mark_processed(&format!("/t{}/f{}.mkv", t, i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(journal.processed_list().unwrap().len(), 800);
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let store = Arc::new(MemoryStore::new());
        let good = serde_json::to_value(TransferTask::new("/ok.mkv", "/d")).unwrap();
        store
            .set(WAITING_LIST_KEY, serde_json::json!([good, {"bogus": 1}, "x"]))
            .unwrap();
        let journal = QueueJournal::new(store);

        let queue = TaskQueue::new(1).unwrap();
        assert_eq!(journal.restore(&queue).unwrap(), 1);
    }

    #[test]
    fn test_processed_list_bounded_and_deduped() {
        let journal = journal();
        for i in 0..(PROCESSED_LIST_CAPACITY + 5) {
            journal.mark_processed(&format!("/f{}.mkv", i)).unwrap();
        }
        journal.mark_processed("/f10.mkv").unwrap();

        let list = journal.processed_list().unwrap();
        assert_eq!(list.len(), PROCESSED_LIST_CAPACITY);
        assert_eq!(list.last().map(String::as_str), Some("/f10.mkv"));
        assert!(!list.contains(&"/f0.mkv".to_string()));
        assert!(journal.is_processed("/f10.mkv").unwrap());
    }

    #[test]
    fn test_prune_processed() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.mkv");
        std::fs::write(&present, b"x").unwrap();
        let gone = dir.path().join("gone.mkv");

        let journal = QueueJournal::new(Arc::new(
            JsonFileStore::open(dir.path().join("state.json")).unwrap(),
        ));
        journal
            .mark_processed(&present.to_string_lossy())
            .unwrap();
        journal.mark_processed(&gone.to_string_lossy()).unwrap();

        assert_eq!(journal.prune_processed().unwrap(), 1);
        assert_eq!(
            journal.processed_list().unwrap(),
            vec![present.to_string_lossy().to_string()]
        );
    }
}
