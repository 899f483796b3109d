use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::info;

use taskmesh_core::errors::MeshResult;
use taskmesh_core::models::{Message, Task};
use taskmesh_core::AppConfig;
use taskmesh_dispatcher::{
    ActionHandler, ActionRegistry, HandlerOptions, HandlerOutcome, JobScheduler, MessageSender,
    SchedulerService, TaskEngine, TaskSubmission,
};
use taskmesh_infrastructure::{HttpTransport, MemoryMessageRepository, MemoryTaskRepository};

/// 连通性探测动作：原样回显输入
struct PingHandler;

#[async_trait]
impl ActionHandler for PingHandler {
    async fn handle(&self, task: &Task) -> MeshResult<HandlerOutcome> {
        Ok(HandlerOutcome::Output(task.input_data.clone()))
    }
}

/// 主应用程序
///
/// 组装存储、传输、注册表、任务引擎与调度服务。入站HTTP端点属于
/// 外部协作方，它拿到的集成点是 [`Application::handle_inbound`]。
pub struct Application {
    engine: Arc<TaskEngine>,
    scheduler: Arc<SchedulerService>,
}

impl Application {
    /// 创建应用实例
    ///
    /// 调用方在启动前把业务动作注册进registry；内置的
    /// `taskmesh.ping` 动作在这里注册。
    pub fn new(config: AppConfig, mut registry: ActionRegistry) -> Result<Self> {
        info!(node_url = %config.node.node_url, "初始化应用程序");

        registry
            .register(
                "taskmesh.ping",
                "taskmesh",
                Arc::new(PingHandler),
                HandlerOptions {
                    is_task: true,
                    ..Default::default()
                },
            )
            .context("注册内置动作失败")?;

        let task_repo = Arc::new(MemoryTaskRepository::new());
        let message_repo = Arc::new(MemoryMessageRepository::new());
        let transport =
            Arc::new(HttpTransport::new(&config.transport).context("创建HTTP传输失败")?);

        let sender = Arc::new(MessageSender::new(
            message_repo.clone(),
            transport,
            config.node.clone(),
        ));

        let board = Arc::new(JobScheduler::new());
        let engine = Arc::new(TaskEngine::new(
            task_repo,
            message_repo,
            Arc::new(registry),
            sender,
            board.clone(),
            config.node.clone(),
            config.scheduler.clone(),
        ));

        let scheduler = Arc::new(SchedulerService::new(
            board,
            engine.clone(),
            config.scheduler.clone(),
        ));

        Ok(Self { engine, scheduler })
    }

    /// 入站消息的集成点，由外部HTTP层调用
    pub async fn handle_inbound(&self, raw: Value) -> MeshResult<Message> {
        self.engine.receive_message(raw).await
    }

    /// 创建并立即分发一个新任务
    pub async fn submit_task(&self, submission: TaskSubmission) -> MeshResult<Task> {
        let task = self.engine.create_task(submission).await?;
        self.engine.dispatch_task(&task.id).await?;
        Ok(task)
    }

    pub fn engine(&self) -> Arc<TaskEngine> {
        self.engine.clone()
    }

    /// 运行应用直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let scheduler_handle = {
            let scheduler = Arc::clone(&self.scheduler);
            let shutdown_rx = shutdown_rx.resubscribe();
            tokio::spawn(async move {
                scheduler.run_loop(shutdown_rx).await;
            })
        };

        let _ = shutdown_rx.recv().await;
        info!("应用收到关闭信号");

        let _ = scheduler_handle.await;
        info!("应用已停止");
        Ok(())
    }
}
