//! 任务队列
//!
//! 优先级队列 + 并发准入 + 活跃集合 + 完成记录。
//!
//! 状态机：`queued -> active -> {completed | queued(retry) | failed}`
//!
//! 所有可变状态由同一把锁保护，临界区内不做任何 IO。
//! `next_ready` 在同一临界区内完成"挑选 + 标记活跃"，保证同一任务不会被交给两个执行单元。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::task::{TaskPriority, TaskState, TransferTask};
use crate::error::{EngineError, EngineResult};
use crate::retry::{BackoffPolicy, ErrorKind};

/// 已完成记录保留数量
pub const COMPLETED_HISTORY_CAPACITY: usize = 100;
/// 失败记录保留数量
pub const FAILED_HISTORY_CAPACITY: usize = 50;

/// 队列排序键：(优先级, 创建时间, 入队序号)
type QueueKey = (TaskPriority, DateTime<Utc>, u64);

/// 队列快照
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// 等待中任务数
    pub queued: usize,
    /// 执行中任务数
    pub active: usize,
    /// 已完成记录数
    pub completed: usize,
    /// 失败记录数
    pub failed: usize,
    /// 累计入队数
    pub total_queued: u64,
    /// 累计处理数
    pub total_processed: u64,
    /// 累计成功数
    pub total_success: u64,
    /// 累计失败数
    pub total_failed: u64,
    /// 当前并发上限
    pub max_concurrent: usize,
}

/// 重试决策结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    /// 已重新入队
    Scheduled {
        next_retry_at: DateTime<Utc>,
        delay: Duration,
    },
    /// 尝试次数已用完，未入队
    Exhausted,
}

/// 活跃任务
#[derive(Debug, Clone)]
struct ActiveEntry {
    task: TransferTask,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueueState {
    /// 等待队列（按排序键有序）
    pending: BTreeMap<QueueKey, TransferTask>,
    /// 活跃任务 id -> 任务
    active: HashMap<String, ActiveEntry>,
    /// 已完成记录（最近 100 条）
    completed: VecDeque<TransferTask>,
    /// 失败记录（最近 50 条）
    failed: VecDeque<TransferTask>,
    /// 入队序号
    next_seq: u64,
    max_concurrent: usize,
    total_queued: u64,
    total_processed: u64,
    total_success: u64,
    total_failed: u64,
}

impl QueueState {
    fn insert(&mut self, mut task: TransferTask) {
        task.state = TaskState::Queued;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.insert((task.priority, task.created_at, seq), task);
    }
}

/// 任务队列
#[derive(Debug)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
}

impl TaskQueue {
    /// 创建新的任务队列
    ///
    /// 并发上限为 0 属于致命配置错误
    pub fn new(max_concurrent: usize) -> EngineResult<Self> {
        if max_concurrent == 0 {
            return Err(EngineError::Config("并发上限必须大于 0".to_string()));
        }

        info!("创建任务队列，最大并发数: {}", max_concurrent);

        Ok(Self {
            state: Mutex::new(QueueState {
                max_concurrent,
                ..Default::default()
            }),
        })
    }

    /// 动态调整并发上限
    ///
    /// 缩容不会中断已在执行的任务，只影响之后的准入
    pub fn set_max_concurrent(&self, new_max: usize) -> EngineResult<()> {
        if new_max == 0 {
            return Err(EngineError::InvalidArgument("并发上限必须大于 0".to_string()));
        }
        let mut state = self.state.lock();
        let old_max = std::mem::replace(&mut state.max_concurrent, new_max);
        info!("动态调整最大并发数: {} -> {}", old_max, new_max);
        Ok(())
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_concurrent
    }

    /// 加入队列（不去重）
    pub fn add(&self, task: TransferTask) {
        let mut state = self.state.lock();
        debug!(
            "任务入队: id={}, source={}, priority={:?}",
            task.id, task.source_path, task.priority
        );
        state.insert(task);
        state.total_queued += 1;
    }

    /// 取出下一个可执行任务并标记为活跃
    pub fn next_ready(&self) -> Option<TransferTask> {
        self.next_ready_at(Utc::now())
    }

    /// 以指定时间判断就绪，取出下一个可执行任务
    ///
    /// 活跃数达到上限时返回 None；未到重试时间的任务保留在队列中
    pub fn next_ready_at(&self, now: DateTime<Utc>) -> Option<TransferTask> {
        let mut state = self.state.lock();

        if state.active.len() >= state.max_concurrent {
            return None;
        }

        let key = state
            .pending
            .iter()
            .find(|(_, task)| task.is_ready_at(now) && !state.active.contains_key(&task.id))
            .map(|(key, _)| *key)?;

        let mut task = state.pending.remove(&key)?;
        task.state = TaskState::Active;
        state.active.insert(
            task.id.clone(),
            ActiveEntry {
                task: task.clone(),
                started_at: now,
            },
        );
        Some(task)
    }

    /// 标记任务为活跃（手动分发时使用）
    ///
    /// 如果任务仍在等待队列中，会先将其移出
    pub fn mark_active(&self, task: &TransferTask) {
        let mut state = self.state.lock();
        state.pending.retain(|_, t| t.id != task.id);
        let mut task = task.clone();
        task.state = TaskState::Active;
        state.active.insert(
            task.id.clone(),
            ActiveEntry {
                task,
                started_at: Utc::now(),
            },
        );
    }

    /// 标记任务完成（成功或失败）
    ///
    /// 任务不在活跃集合中时不做任何记录，返回 false
    pub fn mark_completed(&self, task: &TransferTask, success: bool) -> bool {
        let mut state = self.state.lock();

        if state.active.remove(&task.id).is_none() {
            warn!("任务 {} 不在活跃集合中，忽略完成标记", task.id);
            return false;
        }

        let mut record = task.clone();
        state.total_processed += 1;
        if success {
            record.state = TaskState::Completed;
            state.total_success += 1;
            state.completed.push_back(record);
            while state.completed.len() > COMPLETED_HISTORY_CAPACITY {
                state.completed.pop_front();
            }
        } else {
            record.state = TaskState::Failed;
            state.total_failed += 1;
            state.failed.push_back(record);
            while state.failed.len() > FAILED_HISTORY_CAPACITY {
                state.failed.pop_front();
            }
        }
        true
    }

    /// 从活跃集合移除（幂等）
    pub fn release(&self, task_id: &str) -> bool {
        self.state.lock().active.remove(task_id).is_some()
    }

    /// 重试决策
    ///
    /// 每次调用记一次失败（`retry_count` 加一）。达到 `max_attempts` 时返回
    /// `Exhausted` 且不入队；否则按递增前的次数计算退避、提升优先级并重新入队。
    /// 若该任务出现在失败记录中，移除该记录并回退 `total_failed`，与重新入队在同一临界区完成。
    pub fn retry(
        &self,
        task: &mut TransferTask,
        max_attempts: u32,
        policy: &BackoffPolicy,
    ) -> RetryOutcome {
        self.retry_at(task, max_attempts, policy, Utc::now())
    }

    pub fn retry_at(
        &self,
        task: &mut TransferTask,
        max_attempts: u32,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> RetryOutcome {
        self.retry_inner(task, max_attempts, policy, now, false)
            .unwrap_or(RetryOutcome::Exhausted)
    }

    /// 执行单元内的重试决策
    ///
    /// 与 `retry` 相同，但任务必须仍在活跃集合中（检查与重新入队在同一临界区）；
    /// 任务已被清理时返回 None 且不入队
    pub fn retry_in_flight(
        &self,
        task: &mut TransferTask,
        max_attempts: u32,
        policy: &BackoffPolicy,
    ) -> Option<RetryOutcome> {
        self.retry_inner(task, max_attempts, policy, Utc::now(), true)
    }

    fn retry_inner(
        &self,
        task: &mut TransferTask,
        max_attempts: u32,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
        require_active: bool,
    ) -> Option<RetryOutcome> {
        let mut state = self.state.lock();
        if require_active && !state.active.contains_key(&task.id) {
            return None;
        }

        let next_retry_at = task.schedule_retry_at(now, policy);
        task.retry_count += 1;

        if task.retry_count >= max_attempts {
            task.next_retry_at = None;
            debug!(
                "任务 {} 已失败 {} 次，达到上限 {}",
                task.id, task.retry_count, max_attempts
            );
            return Some(RetryOutcome::Exhausted);
        }

        task.priority = task.priority.escalate();
        let delay = (next_retry_at - now).to_std().unwrap_or_default();

        let before = state.failed.len();
        state.failed.retain(|t| t.id != task.id);
        let removed = (before - state.failed.len()) as u64;
        if removed > 0 {
            state.total_failed = state.total_failed.saturating_sub(removed);
        }
        state.insert(task.clone());
        drop(state);

        debug!(
            "任务 {} 计划重试: 第 {} 次, 延迟 {:?}, 优先级 {:?}",
            task.id, task.retry_count, delay, task.priority
        );

        Some(RetryOutcome::Scheduled {
            next_retry_at,
            delay,
        })
    }

    /// 把仍在执行的任务原样放回等待队列（关闭时使用）
    ///
    /// 不计失败、不改重试次数和优先级；任务已不在活跃集合中时返回 false
    pub fn requeue(&self, task: &TransferTask) -> bool {
        let mut state = self.state.lock();
        if !state.active.contains_key(&task.id) {
            return false;
        }
        let mut task = task.clone();
        task.next_retry_at = None;
        state.insert(task);
        true
    }

    /// 清理卡死的活跃任务，移入失败记录
    pub fn purge_stuck(&self, max_age: Duration) -> Vec<TransferTask> {
        self.purge_stuck_at(max_age, Utc::now())
    }

    pub fn purge_stuck_at(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<TransferTask> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let mut state = self.state.lock();

        let stuck_ids: Vec<String> = state
            .active
            .iter()
            .filter(|(_, entry)| now - entry.started_at > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        let mut purged = Vec::with_capacity(stuck_ids.len());
        for id in stuck_ids {
            if let Some(entry) = state.active.remove(&id) {
                let mut task = entry.task;
                task.state = TaskState::Failed;
                task.record_error(
                    format!("任务执行超过 {} 分钟未结束，已清理", max_age.num_minutes()),
                    ErrorKind::Temporary,
                );
                state.total_processed += 1;
                state.total_failed += 1;
                state.failed.push_back(task.clone());
                while state.failed.len() > FAILED_HISTORY_CAPACITY {
                    state.failed.pop_front();
                }
                purged.push(task);
            }
        }
        purged
    }

    /// 从等待队列移除任务
    pub fn remove_queued(&self, task_id: &str) -> Option<TransferTask> {
        let mut state = self.state.lock();
        let key = state
            .pending
            .iter()
            .find(|(_, t)| t.id == task_id)
            .map(|(key, _)| *key)?;
        state.pending.remove(&key)
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.state.lock().active.contains_key(task_id)
    }

    /// 等待中任务（按调度顺序）
    pub fn queued_tasks(&self) -> Vec<TransferTask> {
        self.state.lock().pending.values().cloned().collect()
    }

    /// 未完成任务（执行中 + 等待中），同一临界区内读取
    ///
    /// 同一任务同时出现在两处时（已重新入队但执行单元尚未退出）只保留等待中的副本
    pub fn unfinished_tasks(&self) -> Vec<TransferTask> {
        let state = self.state.lock();
        let pending_ids: HashSet<&str> = state.pending.values().map(|t| t.id.as_str()).collect();
        let mut tasks: Vec<TransferTask> = state
            .active
            .values()
            .filter(|entry| !pending_ids.contains(entry.task.id.as_str()))
            .map(|entry| entry.task.clone())
            .collect();
        tasks.extend(state.pending.values().cloned());
        tasks
    }

    /// 当前就绪但未分发的任务数
    pub fn ready_count(&self) -> usize {
        let now = Utc::now();
        self.state
            .lock()
            .pending
            .values()
            .filter(|t| t.is_ready_at(now))
            .count()
    }

    /// 执行中任务
    pub fn active_tasks(&self) -> Vec<TransferTask> {
        self.state
            .lock()
            .active
            .values()
            .map(|entry| entry.task.clone())
            .collect()
    }

    pub fn completed_history(&self) -> Vec<TransferTask> {
        self.state.lock().completed.iter().cloned().collect()
    }

    pub fn failed_history(&self) -> Vec<TransferTask> {
        self.state.lock().failed.iter().cloned().collect()
    }

    /// 清空已完成记录
    pub fn clear_completed(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.completed.len();
        state.completed.clear();
        count
    }

    /// 清空失败记录
    pub fn clear_failed(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.failed.len();
        state.failed.clear();
        count
    }

    /// 获取队列快照
    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        QueueSnapshot {
            queued: state.pending.len(),
            active: state.active.len(),
            completed: state.completed.len(),
            failed: state.failed.len(),
            total_queued: state.total_queued,
            total_processed: state.total_processed,
            total_success: state.total_success,
            total_failed: state.total_failed,
            max_concurrent: state.max_concurrent,
        }
    }
}
