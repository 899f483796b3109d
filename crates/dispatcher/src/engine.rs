use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use taskmesh_core::config::{NodeConfig, SchedulerConfig};
use taskmesh_core::errors::{MeshError, MeshResult};
use taskmesh_core::models::{Message, Task, TaskStatus, TaskType};
use taskmesh_core::traits::{MessageRepository, TaskRepository};

use crate::locks::TaskLockMap;
use crate::registry::{ActionRegistry, Registration};
use crate::scheduler::{JobBoard, JobKind};
use crate::security;
use crate::sender::{MessageSender, OutboundMessage};
use crate::UPDATE_TASK_ACTION;

/// 处理器的执行结果
pub enum HandlerOutcome {
    /// 简单/同步任务的输出载荷
    Output(Option<Value>),
    /// chord任务的扇出计划
    Subtasks(Vec<SubtaskSpec>),
}

/// chord处理器声明的一个子任务
#[derive(Debug, Clone)]
pub struct SubtaskSpec {
    pub task_type: TaskType,
    pub action: String,
    pub queue_name: String,
    pub receiver_url: String,
    pub receiver_ssl_cert: String,
    pub input_data: Option<Value>,
}

/// 本节点发起新任务的提交参数
#[derive(Debug, Clone)]
pub struct TaskSubmission {
    pub task_type: TaskType,
    pub action: String,
    pub queue_name: String,
    pub receiver_url: String,
    pub receiver_ssl_cert: String,
    pub input_data: Option<Value>,
    pub task_metadata: Option<Value>,
    pub pingback_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
}

/// 入站消息的线上信封
#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    pub id: String,
    pub action: String,
    pub queue_name: String,
    pub sender_url: String,
    #[serde(default)]
    pub sender_ssl_cert: String,
    #[serde(default)]
    pub input_data: Option<Value>,
    #[serde(default)]
    pub input_async_data: Option<Value>,
    pub task_id: String,
    #[serde(default)]
    pub task_type: Option<TaskType>,
    #[serde(default)]
    pub pingback_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expiration_date: Option<DateTime<Utc>>,
}

/// 纯消息动作（注册选项is_task=false）创建的任务不回报发送方
const SUPPRESS_UPDATE_KEY: &str = "suppress_update";

/// 任务引擎
///
/// 驱动任务状态机：创建并分发任务、处理入站消息、执行处理器、
/// chord扇入聚合、终态传播与回报。所有任务状态写入都在该任务的
/// 独占锁下进行；网络I/O一律在锁外执行（先落意图、放锁、投递、
/// 再拿锁记录结果）。
pub struct TaskEngine {
    task_repo: Arc<dyn TaskRepository>,
    message_repo: Arc<dyn MessageRepository>,
    registry: Arc<ActionRegistry>,
    sender: Arc<MessageSender>,
    board: Arc<dyn JobBoard>,
    locks: TaskLockMap,
    node: NodeConfig,
    scheduler_config: SchedulerConfig,
}

impl TaskEngine {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        message_repo: Arc<dyn MessageRepository>,
        registry: Arc<ActionRegistry>,
        sender: Arc<MessageSender>,
        board: Arc<dyn JobBoard>,
        node: NodeConfig,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self {
            task_repo,
            message_repo,
            registry,
            sender,
            board,
            locks: TaskLockMap::new(),
            node,
            scheduler_config,
        }
    }

    pub fn reserved_queues(&self) -> Vec<String> {
        self.registry.reserved_queues()
    }

    // ------------------------------------------------------------------
    // 发送方路径
    // ------------------------------------------------------------------

    /// 创建一个由本节点发起的任务（created状态）
    pub async fn create_task(&self, submission: TaskSubmission) -> MeshResult<Task> {
        let mut task = Task::new(
            submission.task_type,
            submission.action,
            submission.queue_name,
        );
        task.sender_url = self.node.node_url.clone();
        task.sender_ssl_cert = self.node.ssl_cert.clone();
        task.receiver_url = submission.receiver_url;
        task.receiver_ssl_cert = submission.receiver_ssl_cert;
        task.is_local = task.receiver_url == self.node.node_url;
        task.input_data = submission.input_data;
        if let Some(metadata) = submission.task_metadata {
            task.task_metadata = metadata;
        }

        if let Some(due) = submission.pingback_date {
            task.pingback_date = Some(due);
            task.pingback_pending = true;
        }
        if let Some(due) = submission.expiration_date {
            task.expiration_date = Some(due);
            task.expiration_pending = true;
        }

        self.task_repo.insert(&task).await?;

        // pending标志与作业表保持一致
        if task.pingback_pending {
            self.board
                .schedule(&task.id, JobKind::Pingback, task.pingback_date.unwrap());
        }
        if task.expiration_pending {
            self.board
                .schedule(&task.id, JobKind::Expiration, task.expiration_date.unwrap());
        }

        info!(
            task_id = %task.id,
            action = %task.action,
            task_type = task.task_type.as_str(),
            is_local = task.is_local,
            "创建任务"
        );
        Ok(task)
    }

    /// 分发任务：created → sent（远程）或直接进入接收路径（本地）
    ///
    /// sent状态在投递前落库：远端可能在投递应答返回之前就把终态更新
    /// 推回来，那时发送方副本必须已经处于sent才能接受该更新。传输
    /// 失败时回滚到created并返回Delivery错误，等待到期策略处理。
    pub async fn dispatch_task(&self, task_id: &str) -> MeshResult<()> {
        let lock = self.locks.lock_for(task_id);
        let guard = lock.lock().await;

        let mut task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| MeshError::task_not_found(task_id))?;

        if task.status != TaskStatus::Created {
            // 重复分发是no-op
            debug!(task_id, status = task.status.as_str(), "任务已分发，跳过");
            return Ok(());
        }

        if task.is_local {
            // 本地直达：不出网络，同一行直接进入接收端状态机
            task.status = TaskStatus::Received;
            task.is_received = true;
            task.touch();
            self.task_repo.update(&task).await?;
            drop(guard);
            return Box::pin(self.execute_received(task_id)).await;
        }

        // 发送意图先落库
        task.status = TaskStatus::Sent;
        task.touch();
        self.task_repo.update(&task).await?;

        let outbound = OutboundMessage {
            queue_name: task.queue_name.clone(),
            action: task.action.clone(),
            receiver_url: task.receiver_url.clone(),
            receiver_ssl_cert: task.receiver_ssl_cert.clone(),
            input_data: task.input_data.clone(),
            input_async_data: task.input_async_data.clone(),
            task_id: task.id.clone(),
            pingback_date: task.pingback_date,
            expiration_date: task.expiration_date,
            extra: {
                let mut extra = Map::new();
                extra.insert("task_type".to_string(), json!(task.task_type));
                extra
            },
        };

        // 投递不持任务锁
        drop(guard);
        let outcome = match self.sender.send(outbound).await {
            Ok(message) if message.is_delivery_success() => Ok(()),
            Ok(message) => {
                // 远端拒绝（未知动作等）对发送方而言就是投递失败
                Err(MeshError::delivery_error(format!(
                    "远端拒绝任务 {task_id}: 状态码 {:?}",
                    message.output_status
                )))
            }
            Err(e) => Err(e),
        };

        if let Err(e) = outcome {
            // 回滚到created；终态更新抢先到达时保持终态不动
            let _guard = lock.lock().await;
            if let Some(mut task) = self.task_repo.get_by_id(task_id).await? {
                if task.status == TaskStatus::Sent {
                    task.status = TaskStatus::Created;
                    task.touch();
                    self.task_repo.update(&task).await?;
                }
            }
            return Err(e);
        }

        info!(task_id, "任务已送达远端");
        Ok(())
    }

    /// 显式完成一个任务（同步任务或不自动完成的处理器调用）
    pub async fn finish_task(&self, task_id: &str, output: Option<Value>) -> MeshResult<()> {
        let task = {
            let lock = self.locks.lock_for(task_id);
            let _guard = lock.lock().await;

            let mut task = self
                .task_repo
                .get_by_id(task_id)
                .await?
                .ok_or_else(|| MeshError::task_not_found(task_id))?;

            if task.status == TaskStatus::Finished {
                return Ok(());
            }
            if !task.status.can_transition_to(TaskStatus::Finished) {
                return Err(MeshError::InvalidTransition {
                    from: task.status,
                    to: TaskStatus::Finished,
                });
            }

            if output.is_some() {
                task.output_data = output;
            }
            self.mark_terminal(&mut task, TaskStatus::Finished);
            self.task_repo.update(&task).await?;
            task
        };

        info!(task_id, "任务完成");
        self.propagate_terminal(task).await
    }

    /// 将任务置为error并按fail-fast策略向上传播
    pub async fn fail_task(&self, task_id: &str, reason: &str) -> MeshResult<()> {
        let task = {
            let lock = self.locks.lock_for(task_id);
            let _guard = lock.lock().await;

            let mut task = self
                .task_repo
                .get_by_id(task_id)
                .await?
                .ok_or_else(|| MeshError::task_not_found(task_id))?;

            if task.is_terminal() {
                return Ok(());
            }

            task.output_data = Some(json!({ "error": reason }));
            self.mark_terminal(&mut task, TaskStatus::Error);
            self.task_repo.update(&task).await?;
            task
        };

        warn!(task_id, reason, "任务进入error状态");
        self.propagate_terminal(task).await
    }

    /// 显式取消：终态前的任意时点可强制置为error，
    /// 名下的延迟作业随状态写入一并原子取消
    pub async fn cancel_task(&self, task_id: &str) -> MeshResult<()> {
        self.fail_task(task_id, "cancelled").await
    }

    // ------------------------------------------------------------------
    // 接收方路径
    // ------------------------------------------------------------------

    /// 处理一条入站消息
    ///
    /// 幂等：带相同id的重复消息直接返回已存的记录，处理器不会再次
    /// 执行。安全门拒绝与未知动作以错误返回，拒绝的消息也会落库，
    /// 发送方可以通过投递状态观察到。
    pub async fn receive_message(&self, raw: Value) -> MeshResult<Message> {
        let envelope: InboundEnvelope = serde_json::from_value(raw)?;

        if let Some(existing) = self.message_repo.get_by_id(&envelope.id).await? {
            info!(message_id = %envelope.id, "重复投递的消息，返回已存记录");
            return Ok(existing);
        }

        if envelope.action == UPDATE_TASK_ACTION {
            return self.apply_update(envelope).await;
        }

        let registration = self
            .registry
            .resolve(&envelope.action, &envelope.queue_name)?;
        if registration.options.is_internal {
            // 内部动作不接受远端消息
            return Err(MeshError::unknown_action(
                envelope.action.as_str(),
                envelope.queue_name.as_str(),
            ));
        }

        if registration.options.local_only {
            if let Err(e) = security::authorize_local(&self.node.ssl_cert, &envelope.sender_ssl_cert)
            {
                let mut rejected = self.message_from_envelope(&envelope);
                rejected.output_status = Some(e.status_code());
                rejected.info_text = Some("发送方证书校验失败".to_string());
                self.message_repo.insert(&rejected).await?;
                return Err(e);
            }
        }

        let mut message = self.message_from_envelope(&envelope);
        self.message_repo.insert(&message).await?;

        self.find_or_create_received_task(&envelope, &registration)
            .await?;

        let result = self.execute_received(&envelope.task_id).await;
        message.output_status = Some(match &result {
            Ok(()) => 200,
            Err(e) => e.status_code(),
        });
        if let Err(e) = &result {
            message.info_text = Some(e.to_string());
        }
        self.message_repo.update(&message).await?;
        Ok(message)
    }

    /// 调度器到点触发：向发送方回送进度更新（或重发未送达的终态更新）
    pub async fn fire_pingback(&self, task_id: &str) -> MeshResult<()> {
        let lock = self.locks.lock_for(task_id);
        let guard = lock.lock().await;

        let Some(mut task) = self.task_repo.get_by_id(task_id).await? else {
            return Ok(());
        };

        // 作业已被摘取，标志同步回任务行
        task.pingback_pending = false;

        if task.is_terminal() {
            let resend = task.update_unsent();
            task.touch();
            self.task_repo.update(&task).await?;
            drop(guard);
            if resend {
                debug!(task_id, "重发未送达的终态更新");
                self.send_status_update(&task).await;
            }
            return Ok(());
        }

        // 周期性pingback重新arm，一次性的到此为止
        if let Some(interval) = task.pingback_interval_seconds() {
            let next = Utc::now() + chrono::Duration::seconds(interval);
            task.pingback_date = Some(next);
            task.pingback_pending = true;
            self.board.schedule(task_id, JobKind::Pingback, next);
        }
        task.touch();
        self.task_repo.update(&task).await?;
        let snapshot = task.clone();
        drop(guard);

        if snapshot.is_received && !snapshot.is_local {
            debug!(task_id, "发送pingback进度更新");
            self.send_status_update(&snapshot).await;
        }
        Ok(())
    }

    /// 调度器到点触发：未完成的任务强制到期
    ///
    /// 作业触发前已从作业表移除，终态检查保证即使循环多跑几个tick
    /// 也不会出现第二次expiration。
    pub async fn fire_expiration(&self, task_id: &str) -> MeshResult<()> {
        let task = {
            let lock = self.locks.lock_for(task_id);
            let _guard = lock.lock().await;

            let Some(mut task) = self.task_repo.get_by_id(task_id).await? else {
                return Ok(());
            };
            task.expiration_pending = false;

            if task.is_terminal() {
                task.touch();
                self.task_repo.update(&task).await?;
                return Ok(());
            }

            warn!(task_id, "任务到期未完成，强制置为error");
            task.output_data = Some(json!({ "error": "expired" }));
            self.mark_terminal(&mut task, TaskStatus::Error);
            self.task_repo.update(&task).await?;
            task
        };

        self.propagate_terminal(task).await
    }

    /// 保留队列的内部轮询：补扫waiting_subtasks任务的chord完成情况
    pub async fn internal_poll(&self, queue_name: &str) -> MeshResult<()> {
        let waiting = self.task_repo.waiting_on_queue(queue_name).await?;
        for task in waiting {
            if let Some(parent) = self.evaluate_chord(&task.id).await? {
                self.propagate_terminal(parent).await?;
            }
        }
        Ok(())
    }

    /// 重启恢复：按任务行的pending标志重建作业表
    pub async fn recover_scheduled_jobs(&self) -> MeshResult<usize> {
        let tasks = self.task_repo.with_pending_jobs().await?;
        let now = Utc::now();
        let mut recovered = 0;

        for task in tasks {
            if task.pingback_pending {
                self.board.schedule(
                    &task.id,
                    JobKind::Pingback,
                    task.pingback_date.unwrap_or(now),
                );
                recovered += 1;
            }
            if task.expiration_pending {
                self.board.schedule(
                    &task.id,
                    JobKind::Expiration,
                    task.expiration_date.unwrap_or(now),
                );
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // 内部实现
    // ------------------------------------------------------------------

    fn message_from_envelope(&self, envelope: &InboundEnvelope) -> Message {
        let mut message = Message::inbound(
            envelope.id.clone(),
            envelope.queue_name.clone(),
            envelope.action.clone(),
            envelope.task_id.clone(),
        );
        message.sender_url = envelope.sender_url.clone();
        message.sender_ssl_cert = envelope.sender_ssl_cert.clone();
        message.receiver_url = self.node.node_url.clone();
        message.receiver_ssl_cert = self.node.ssl_cert.clone();
        message.input_data = envelope.input_data.clone();
        message.input_async_data = envelope.input_async_data.clone();
        message.pingback_date = envelope.pingback_date;
        message.expiration_date = envelope.expiration_date;
        message
    }

    /// 入站任务消息对应的接收端任务行；重投时已存在，直接复用
    async fn find_or_create_received_task(
        &self,
        envelope: &InboundEnvelope,
        registration: &Registration,
    ) -> MeshResult<Task> {
        if let Some(task) = self.task_repo.get_by_id(&envelope.task_id).await? {
            return Ok(task);
        }

        let mut task = Task::new(
            envelope.task_type.unwrap_or(TaskType::Simple),
            envelope.action.clone(),
            envelope.queue_name.clone(),
        );
        task.id = envelope.task_id.clone();
        task.status = TaskStatus::Received;
        task.is_received = true;
        task.sender_url = envelope.sender_url.clone();
        task.sender_ssl_cert = envelope.sender_ssl_cert.clone();
        task.receiver_url = self.node.node_url.clone();
        task.receiver_ssl_cert = self.node.ssl_cert.clone();
        task.input_data = envelope.input_data.clone();
        task.input_async_data = envelope.input_async_data.clone();
        if !registration.options.is_task {
            // 纯消息动作：执行完即静默完成，不回报发送方
            task.task_metadata = json!({ SUPPRESS_UPDATE_KEY: true });
        }

        if let Some(due) = envelope.pingback_date {
            task.pingback_date = Some(due);
            task.pingback_pending = true;
        }
        if let Some(due) = envelope.expiration_date {
            task.expiration_date = Some(due);
            task.expiration_pending = true;
        }

        self.task_repo.insert(&task).await?;

        if task.pingback_pending {
            self.board
                .schedule(&task.id, JobKind::Pingback, task.pingback_date.unwrap());
        }
        if task.expiration_pending {
            self.board
                .schedule(&task.id, JobKind::Expiration, task.expiration_date.unwrap());
        }

        info!(
            task_id = %task.id,
            action = %task.action,
            task_type = task.task_type.as_str(),
            "接收到新任务"
        );
        Ok(task)
    }

    /// 接收端执行：received → executing → 处理器 → 终态/扇出
    async fn execute_received(&self, task_id: &str) -> MeshResult<()> {
        let snapshot = {
            let lock = self.locks.lock_for(task_id);
            let _guard = lock.lock().await;

            let mut task = self
                .task_repo
                .get_by_id(task_id)
                .await?
                .ok_or_else(|| MeshError::task_not_found(task_id))?;

            if task.status != TaskStatus::Received {
                // 重投的消息落到已在执行或已终态的任务上，no-op
                debug!(task_id, status = task.status.as_str(), "任务已在执行，跳过");
                return Ok(());
            }

            task.status = TaskStatus::Executing;
            task.touch();
            self.task_repo.update(&task).await?;
            task
        };

        let registration = self
            .registry
            .resolve(&snapshot.action, &snapshot.queue_name)?;

        // 处理器在任务锁外执行
        let outcome = registration.handler.handle(&snapshot).await;

        match outcome {
            Err(e) => {
                let reason = e.to_string();
                self.fail_task(task_id, &reason).await?;
                Err(MeshError::domain_error(reason))
            }
            Ok(HandlerOutcome::Output(output)) => {
                if snapshot.behavior().auto_finish_after_handler {
                    self.finish_task(task_id, output).await
                } else {
                    // 同步任务：记下输出但由处理器方显式finish
                    if output.is_some() {
                        let lock = self.locks.lock_for(task_id);
                        let _guard = lock.lock().await;
                        if let Some(mut task) = self.task_repo.get_by_id(task_id).await? {
                            task.output_data = output;
                            task.touch();
                            self.task_repo.update(&task).await?;
                        }
                    }
                    Ok(())
                }
            }
            Ok(HandlerOutcome::Subtasks(specs)) => {
                if snapshot.task_type != TaskType::Chord {
                    let reason = "处理器返回了扇出计划，但任务不是chord类型".to_string();
                    self.fail_task(task_id, &reason).await?;
                    return Err(MeshError::domain_error(reason));
                }
                self.fan_out(task_id, specs).await
            }
        }
    }

    /// chord扇出：创建有序子任务并逐个分发，父任务进入waiting_subtasks
    async fn fan_out(&self, parent_id: &str, specs: Vec<SubtaskSpec>) -> MeshResult<()> {
        let subtask_ids = {
            let lock = self.locks.lock_for(parent_id);
            let _guard = lock.lock().await;

            let mut parent = self
                .task_repo
                .get_by_id(parent_id)
                .await?
                .ok_or_else(|| MeshError::task_not_found(parent_id))?;

            let mut ids = Vec::with_capacity(specs.len());
            for (order, spec) in specs.iter().enumerate() {
                let mut subtask =
                    Task::new(spec.task_type, spec.action.clone(), spec.queue_name.clone());
                subtask.parent_id = Some(parent_id.to_string());
                subtask.order = Some(order as i32);
                subtask.sender_url = self.node.node_url.clone();
                subtask.sender_ssl_cert = self.node.ssl_cert.clone();
                subtask.receiver_url = spec.receiver_url.clone();
                subtask.receiver_ssl_cert = spec.receiver_ssl_cert.clone();
                subtask.is_local = subtask.receiver_url == self.node.node_url;
                subtask.input_data = spec.input_data.clone();
                self.task_repo.insert(&subtask).await?;
                ids.push(subtask.id);
            }

            parent.status = TaskStatus::WaitingSubtasks;
            parent.touch();
            self.task_repo.update(&parent).await?;
            info!(parent_id, subtasks = ids.len(), "chord扇出");
            ids
        };

        // 兄弟子任务之间没有顺序约束，逐个分发；初始分发失败fail-fast
        for subtask_id in &subtask_ids {
            if let Err(e) = Box::pin(self.dispatch_task(subtask_id)).await {
                warn!(parent_id, subtask_id = %subtask_id, error = %e, "子任务初始分发失败");
                self.fail_task(subtask_id, &format!("初始分发失败: {e}"))
                    .await?;
                return Ok(());
            }
        }

        // 空chord立即可完成
        if subtask_ids.is_empty() {
            if let Some(parent) = self.evaluate_chord(parent_id).await? {
                self.propagate_terminal(parent).await?;
            }
        }
        Ok(())
    }

    /// 应用远端回送的状态更新到发送方副本
    async fn apply_update(&self, envelope: InboundEnvelope) -> MeshResult<Message> {
        let mut message = self.message_from_envelope(&envelope);

        let input = envelope.input_data.clone().unwrap_or(Value::Null);
        let new_status: TaskStatus = serde_json::from_value(input["status"].clone())
            .map_err(|e| MeshError::Serialization(format!("非法的状态更新载荷: {e}")))?;
        let output_data = input.get("output_data").cloned().filter(|v| !v.is_null());

        let updated = {
            let lock = self.locks.lock_for(&envelope.task_id);
            let _guard = lock.lock().await;

            let Some(mut task) = self.task_repo.get_by_id(&envelope.task_id).await? else {
                message.output_status = Some(404);
                message.info_text = Some("状态更新指向未知任务".to_string());
                self.message_repo.insert(&message).await?;
                return Err(MeshError::task_not_found(envelope.task_id.clone()));
            };

            if task.status == new_status || task.is_terminal() {
                // 重复更新幂等吸收
                message.output_status = Some(200);
                self.message_repo.insert(&message).await?;
                return Ok(message);
            }
            if !task.status.can_transition_to(new_status) {
                message.output_status = Some(409);
                message.info_text = Some(format!(
                    "非法的状态迁移: {} -> {}",
                    task.status.as_str(),
                    new_status.as_str()
                ));
                self.message_repo.insert(&message).await?;
                return Err(MeshError::InvalidTransition {
                    from: task.status,
                    to: new_status,
                });
            }

            if output_data.is_some() {
                task.output_data = output_data;
            }
            if new_status.is_terminal() {
                self.mark_terminal(&mut task, new_status);
            } else {
                task.status = new_status;
                task.touch();
            }
            self.task_repo.update(&task).await?;
            debug!(
                task_id = %task.id,
                status = new_status.as_str(),
                "应用远端状态更新"
            );
            task
        };

        message.output_status = Some(200);
        self.message_repo.insert(&message).await?;

        if updated.is_terminal() {
            self.propagate_terminal(updated).await?;
        }
        Ok(message)
    }

    /// 终态收尾的统一写入：状态、时间戳、pending标志与作业表原子清理
    ///
    /// 调用方必须已持有该任务的锁并在之后持久化任务行。
    fn mark_terminal(&self, task: &mut Task, status: TaskStatus) {
        task.status = status;
        task.pingback_pending = false;
        task.expiration_pending = false;
        task.touch();
        self.board.cancel_all(&task.id);
    }

    /// 终态传播：回报发送方，并沿父链做chord扇入/fail-fast
    ///
    /// 用循环而不是递归向上爬，防止深层任务树撑爆调用栈。
    async fn propagate_terminal(&self, mut task: Task) -> MeshResult<()> {
        loop {
            if task.is_received
                && !task.is_local
                && task.behavior().send_update_to_sender
                && !task.suppress_update()
            {
                self.send_status_update(&task).await;
            }

            let Some(parent_id) = task.parent_id.clone() else {
                break;
            };
            let next = match task.status {
                TaskStatus::Finished => self.evaluate_chord(&parent_id).await?,
                TaskStatus::Error => self.fail_waiting_parent(&parent_id).await?,
                _ => None,
            };
            match next {
                Some(parent) => task = parent,
                None => break,
            }
        }
        Ok(())
    }

    /// chord扇入评估
    ///
    /// 把每个已完成且未应用的子任务输出按 `order` 位置写入父任务的
    /// 聚合数组（应用恰好一次，靠子任务行上的applied标记保证），全部
    /// 子任务完成后父任务转为finished。聚合结果与子任务完成顺序无关。
    /// 有子任务error时按fail-fast将父任务置为error。
    ///
    /// 父任务因此到达终态时返回Some(parent)，由调用方继续向上传播。
    async fn evaluate_chord(&self, parent_id: &str) -> MeshResult<Option<Task>> {
        let lock = self.locks.lock_for(parent_id);
        let _guard = lock.lock().await;

        let Some(mut parent) = self.task_repo.get_by_id(parent_id).await? else {
            return Ok(None);
        };
        if parent.status != TaskStatus::WaitingSubtasks {
            return Ok(None);
        }

        let subtasks = self.task_repo.subtasks_of(parent_id).await?;

        if subtasks.iter().any(|s| s.status == TaskStatus::Error) {
            parent.output_data = Some(json!({ "error": "subtask_failed" }));
            self.mark_terminal(&mut parent, TaskStatus::Error);
            self.task_repo.update(&parent).await?;
            warn!(parent_id, "子任务失败，chord父任务fail-fast置为error");
            return Ok(Some(parent));
        }

        // 聚合数组按order位置存放，与完成顺序无关
        let mut aggregate = match parent.output_data.take() {
            Some(Value::Array(existing)) if existing.len() == subtasks.len() => existing,
            _ => vec![Value::Null; subtasks.len()],
        };

        let mut all_finished = true;
        for (position, subtask) in subtasks.iter().enumerate() {
            if subtask.status == TaskStatus::Finished {
                if !subtask.chord_applied() {
                    aggregate[position] = subtask.output_data.clone().unwrap_or(Value::Null);
                    let mut applied = subtask.clone();
                    applied.mark_chord_applied();
                    applied.touch();
                    self.task_repo.update(&applied).await?;
                }
            } else {
                all_finished = false;
            }
        }

        parent.output_data = Some(Value::Array(aggregate));
        if all_finished {
            self.mark_terminal(&mut parent, TaskStatus::Finished);
            self.task_repo.update(&parent).await?;
            info!(parent_id, "chord全部子任务完成，父任务finished");
            Ok(Some(parent))
        } else {
            parent.touch();
            self.task_repo.update(&parent).await?;
            Ok(None)
        }
    }

    /// fail-fast：子任务error时把等待中的父任务也置为error
    async fn fail_waiting_parent(&self, parent_id: &str) -> MeshResult<Option<Task>> {
        let lock = self.locks.lock_for(parent_id);
        let _guard = lock.lock().await;

        let Some(mut parent) = self.task_repo.get_by_id(parent_id).await? else {
            return Ok(None);
        };
        if parent.is_terminal() {
            return Ok(None);
        }

        parent.output_data = Some(json!({ "error": "subtask_failed" }));
        self.mark_terminal(&mut parent, TaskStatus::Error);
        self.task_repo.update(&parent).await?;
        warn!(parent_id, "子任务失败，父任务置为error");
        Ok(Some(parent))
    }

    /// 向原始发送方回送状态更新
    ///
    /// 投递失败不影响任务自身的终态：打上未送达标记并登记重发作业，
    /// 由调度器按配置的间隔重试。
    async fn send_status_update(&self, task: &Task) {
        let outbound = OutboundMessage {
            queue_name: task.queue_name.clone(),
            action: UPDATE_TASK_ACTION.to_string(),
            receiver_url: task.sender_url.clone(),
            receiver_ssl_cert: task.sender_ssl_cert.clone(),
            input_data: Some(json!({
                "status": task.status,
                "output_data": task.output_data,
            })),
            input_async_data: None,
            task_id: task.id.clone(),
            pingback_date: None,
            expiration_date: None,
            extra: Map::new(),
        };

        match self.sender.send(outbound).await {
            Ok(message) if message.is_delivery_success() => {
                if task.update_unsent() {
                    let lock = self.locks.lock_for(&task.id);
                    let _guard = lock.lock().await;
                    if let Ok(Some(mut stored)) = self.task_repo.get_by_id(&task.id).await {
                        stored.set_update_unsent(false);
                        stored.touch();
                        let _ = self.task_repo.update(&stored).await;
                    }
                }
            }
            Ok(message) => {
                // 接收方拒绝（409/404等）与传输失败同样登记重发
                warn!(
                    task_id = %task.id,
                    status = ?message.output_status,
                    "状态更新被远端拒绝，登记重发"
                );
                self.schedule_update_retry(&task.id).await;
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "状态更新投递失败，登记重发");
                self.schedule_update_retry(&task.id).await;
            }
        }
    }

    /// 终态更新未能送达：打上未送达标记并登记pingback重发作业
    async fn schedule_update_retry(&self, task_id: &str) {
        let retry_due = Utc::now()
            + chrono::Duration::seconds(self.scheduler_config.update_retry_base_seconds as i64);
        let lock = self.locks.lock_for(task_id);
        let _guard = lock.lock().await;
        if let Ok(Some(mut stored)) = self.task_repo.get_by_id(task_id).await {
            stored.set_update_unsent(true);
            stored.pingback_pending = true;
            stored.pingback_date = Some(retry_due);
            stored.touch();
            let _ = self.task_repo.update(&stored).await;
            self.board.schedule(task_id, JobKind::Pingback, retry_due);
        }
    }
}

/// suppress_update标记只在引擎侧有意义，以扩展trait的形式挂在Task上
trait SuppressUpdate {
    fn suppress_update(&self) -> bool;
}

impl SuppressUpdate for Task {
    fn suppress_update(&self) -> bool {
        self.task_metadata
            .get(SUPPRESS_UPDATE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}
