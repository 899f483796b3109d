use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use taskmesh_core::errors::{MeshError, MeshResult};
use taskmesh_core::models::Task;

use crate::engine::HandlerOutcome;

/// 动作处理器
///
/// 注册表里的一等处理能力。简单/同步任务的处理器返回
/// [`HandlerOutcome::Output`]，chord任务的处理器返回
/// [`HandlerOutcome::Subtasks`] 描述扇出计划。业务失败以Domain错误
/// 返回，引擎负责写入任务输出并按失败策略传播。
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> MeshResult<HandlerOutcome>;
}

/// 处理器注册选项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HandlerOptions {
    /// 走完整任务生命周期（状态更新回报发送方）还是纯消息动作
    pub is_task: bool,
    /// 内部动作，只接受本节点进程内提交，远端消息一律拒绝
    pub is_internal: bool,
    /// 仅限本地：执行前安全门校验发送方证书等于本节点证书
    pub local_only: bool,
}

/// 一条注册表项
#[derive(Clone)]
pub struct Registration {
    pub handler: Arc<dyn ActionHandler>,
    pub options: HandlerOptions,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// 动作注册表
///
/// (action, queue) 到处理器的静态映射，进程启动时通过显式register
/// 调用填充，之后只读，可并发访问。
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<(String, String), Registration>,
    reserved_queues: HashSet<String>,
}

/// 合法标识符：非空且只含字母数字与 `_ . -`
fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个动作处理器
    ///
    /// action或queue不是合法标识符、或同一(action, queue)已以不同
    /// 选项注册时返回Configuration错误；完全相同的重复注册是no-op。
    pub fn register(
        &mut self,
        action: &str,
        queue: &str,
        handler: Arc<dyn ActionHandler>,
        options: HandlerOptions,
    ) -> MeshResult<()> {
        if !is_valid_identifier(action) {
            return Err(MeshError::config_error(format!(
                "非法的动作名: {action:?}"
            )));
        }
        if !is_valid_identifier(queue) {
            return Err(MeshError::config_error(format!(
                "非法的队列名: {queue:?}"
            )));
        }

        let key = (action.to_string(), queue.to_string());
        if let Some(existing) = self.handlers.get(&key) {
            if existing.options != options {
                return Err(MeshError::config_error(format!(
                    "动作 {action} (队列 {queue}) 已以不同选项注册"
                )));
            }
            debug!(action, queue, "重复注册，忽略");
            return Ok(());
        }

        info!(action, queue, ?options, "注册动作处理器");
        self.handlers.insert(key, Registration { handler, options });
        if options.is_task {
            self.reserve_queue(queue)?;
        }
        Ok(())
    }

    /// 解析(action, queue)对应的注册项
    pub fn resolve(&self, action: &str, queue: &str) -> MeshResult<Registration> {
        self.handlers
            .get(&(action.to_string(), queue.to_string()))
            .cloned()
            .ok_or_else(|| MeshError::unknown_action(action, queue))
    }

    /// 标记某队列存在任务型消费者，调度器会对其做内部轮询
    pub fn reserve_queue(&mut self, queue: &str) -> MeshResult<()> {
        if !is_valid_identifier(queue) {
            return Err(MeshError::config_error(format!(
                "非法的队列名: {queue:?}"
            )));
        }
        self.reserved_queues.insert(queue.to_string());
        Ok(())
    }

    pub fn reserved_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.reserved_queues.iter().cloned().collect();
        queues.sort();
        queues
    }
}
