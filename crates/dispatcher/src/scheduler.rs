use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use taskmesh_core::config::SchedulerConfig;
use taskmesh_core::errors::MeshResult;

use crate::engine::TaskEngine;

/// 延迟作业类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// 向原始发送方回送进度更新
    Pingback,
    /// 到期未完成的任务强制置为error
    Expiration,
    /// 保留队列的内部轮询（此时键里的task_id是队列名）
    InternalPoll,
}

/// 一个到期作业
#[derive(Debug, Clone)]
pub struct Job {
    pub task_id: String,
    pub kind: JobKind,
    pub due_at: DateTime<Utc>,
}

/// 作业登记面板
///
/// 引擎通过本trait登记/取消延迟作业，与作业的实际触发解耦。
/// 每个(task, kind)至多存在一个活动作业。
pub trait JobBoard: Send + Sync {
    /// 登记作业，替换同任务同类型的已有作业
    fn schedule(&self, task_id: &str, kind: JobKind, due_at: DateTime<Utc>);

    /// 取消作业，作业存在时返回true
    fn cancel(&self, task_id: &str, kind: JobKind) -> bool;

    /// 任务到达终态时原子地清掉它名下的全部作业
    fn cancel_all(&self, task_id: &str);

    fn pending(&self, task_id: &str, kind: JobKind) -> bool;
}

/// 内存作业表
///
/// 调度器独占的作业表，键是(task_id, kind)。作业在触发前先从表中
/// 移除，保证同一作业即使循环多跑几个tick也只触发一次。
#[derive(Default)]
pub struct JobScheduler {
    jobs: Mutex<HashMap<(String, JobKind), DateTime<Utc>>>,
}

impl JobScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// 摘取所有到期作业（从表中移除），按到期时间升序
    pub fn take_due(&self, now: DateTime<Utc>) -> Vec<Job> {
        let mut jobs = self.jobs.lock().expect("作业表poisoned");
        let due_keys: Vec<(String, JobKind)> = jobs
            .iter()
            .filter(|(_, due_at)| **due_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let mut due: Vec<Job> = due_keys
            .into_iter()
            .filter_map(|key| {
                jobs.remove(&key).map(|due_at| Job {
                    task_id: key.0,
                    kind: key.1,
                    due_at,
                })
            })
            .collect();
        due.sort_by_key(|job| job.due_at);
        due
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().expect("作业表poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl JobBoard for JobScheduler {
    fn schedule(&self, task_id: &str, kind: JobKind, due_at: DateTime<Utc>) {
        let mut jobs = self.jobs.lock().expect("作业表poisoned");
        let replaced = jobs
            .insert((task_id.to_string(), kind), due_at)
            .is_some();
        debug!(task_id, ?kind, %due_at, replaced, "登记延迟作业");
    }

    fn cancel(&self, task_id: &str, kind: JobKind) -> bool {
        let mut jobs = self.jobs.lock().expect("作业表poisoned");
        jobs.remove(&(task_id.to_string(), kind)).is_some()
    }

    fn cancel_all(&self, task_id: &str) {
        let mut jobs = self.jobs.lock().expect("作业表poisoned");
        jobs.retain(|(id, _), _| id != task_id);
    }

    fn pending(&self, task_id: &str, kind: JobKind) -> bool {
        let jobs = self.jobs.lock().expect("作业表poisoned");
        jobs.contains_key(&(task_id.to_string(), kind))
    }
}

/// 调度服务
///
/// 单线程协作式定时循环：每个tick摘取到期作业并交给引擎处理，
/// 任务的实际状态写入由引擎在对应任务锁下完成。
pub struct SchedulerService {
    board: Arc<JobScheduler>,
    engine: Arc<TaskEngine>,
    config: SchedulerConfig,
}

impl SchedulerService {
    pub fn new(board: Arc<JobScheduler>, engine: Arc<TaskEngine>, config: SchedulerConfig) -> Self {
        Self {
            board,
            engine,
            config,
        }
    }

    /// 启动准备：重启恢复pending作业，并给每个保留队列arm内部轮询
    pub async fn start(&self) -> MeshResult<()> {
        let recovered = self.engine.recover_scheduled_jobs().await?;
        if recovered > 0 {
            info!(recovered, "重启后恢复了pending延迟作业");
        }

        let poll_due =
            Utc::now() + chrono::Duration::seconds(self.config.internal_poll_interval_seconds as i64);
        for queue in self.engine.reserved_queues() {
            self.board.schedule(&queue, JobKind::InternalPoll, poll_due);
        }
        Ok(())
    }

    /// 执行一个tick，返回触发的作业数
    ///
    /// 单个作业的失败只记录日志，不中断本tick的其余作业。
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        let due = self.board.take_due(now);
        let fired = due.len();

        for job in due {
            match job.kind {
                JobKind::Pingback => {
                    if let Err(e) = self.engine.fire_pingback(&job.task_id).await {
                        error!(task_id = %job.task_id, error = %e, "pingback作业执行失败");
                    }
                }
                JobKind::Expiration => {
                    if let Err(e) = self.engine.fire_expiration(&job.task_id).await {
                        error!(task_id = %job.task_id, error = %e, "expiration作业执行失败");
                    }
                }
                JobKind::InternalPoll => {
                    if let Err(e) = self.engine.internal_poll(&job.task_id).await {
                        error!(queue = %job.task_id, error = %e, "内部轮询失败");
                    }
                    // 内部轮询是周期性的，触发后重新arm
                    let next = now
                        + chrono::Duration::seconds(
                            self.config.internal_poll_interval_seconds as i64,
                        );
                    self.board.schedule(&job.task_id, JobKind::InternalPoll, next);
                }
            }
        }
        fired
    }

    /// 定时循环，收到关闭信号后退出
    pub async fn run_loop(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        if let Err(e) = self.start().await {
            error!(error = %e, "调度服务启动准备失败");
            return;
        }

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms));
        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            "调度循环启动"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let fired = self.tick(Utc::now()).await;
                    if fired > 0 {
                        debug!(fired, "本tick触发了到期作业");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("调度循环收到关闭信号，退出");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_replaces_same_kind() {
        let board = JobScheduler::new();
        let t1 = Utc::now() + chrono::Duration::seconds(10);
        let t2 = Utc::now() + chrono::Duration::seconds(99);

        board.schedule("task-1", JobKind::Pingback, t1);
        board.schedule("task-1", JobKind::Pingback, t2);
        // 同任务同类型只保留一个作业
        assert_eq!(board.len(), 1);

        // 不同类型互不影响
        board.schedule("task-1", JobKind::Expiration, t1);
        assert_eq!(board.len(), 2);
    }

    #[test]
    fn test_take_due_removes_jobs() {
        let board = JobScheduler::new();
        let past = Utc::now() - chrono::Duration::seconds(5);
        let future = Utc::now() + chrono::Duration::seconds(500);

        board.schedule("t1", JobKind::Expiration, past);
        board.schedule("t2", JobKind::Expiration, future);

        let due = board.take_due(Utc::now());
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].task_id, "t1");

        // 已摘取的作业不会再次到期
        assert!(board.take_due(Utc::now()).is_empty());
        assert_eq!(board.len(), 1);
    }

    #[test]
    fn test_cancel_all_clears_task_jobs() {
        let board = JobScheduler::new();
        let due = Utc::now() + chrono::Duration::seconds(10);
        board.schedule("t1", JobKind::Pingback, due);
        board.schedule("t1", JobKind::Expiration, due);
        board.schedule("t2", JobKind::Expiration, due);

        board.cancel_all("t1");
        assert!(!board.pending("t1", JobKind::Pingback));
        assert!(!board.pending("t1", JobKind::Expiration));
        assert!(board.pending("t2", JobKind::Expiration));
    }
}
