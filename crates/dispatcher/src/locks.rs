use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as AsyncMutex;

/// 按任务id串行化的锁表
///
/// 所有任务状态写入都要先拿到对应任务的独占锁，保证单任务的状态
/// 迁移可线性化。锁绝不跨网络调用持有：先落意图、放锁、做I/O、
/// 再拿锁记录结果。
///
/// 同一任务id永远对应同一把锁：条目不摘除，与任务行同寿命（终态
/// 任务归档不删除，锁表的规模与任务表一致）。
#[derive(Default)]
pub struct TaskLockMap {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TaskLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取得（或创建）某任务的锁句柄，调用方`.lock().await`后持有
    pub fn lock_for(&self, task_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("锁表poisoned");
        locks
            .entry(task_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.locks.lock().expect("锁表poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
