use async_trait::async_trait;

use crate::errors::MeshResult;
use crate::models::{Message, Task};

/// 任务仓储抽象
///
/// 持久化存储是外部协作方，要求对单个任务提供ACID级别的记录读写。
/// 引擎只通过本trait访问任务记录；嵌入式部署由内存实现承担，
/// 真正的数据库实现可以在不触碰引擎的情况下接入。
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 插入新任务，id重复时返回Storage错误
    async fn insert(&self, task: &Task) -> MeshResult<()>;

    async fn get_by_id(&self, id: &str) -> MeshResult<Option<Task>>;

    /// 整行覆盖更新，任务不存在时返回TaskNotFound
    async fn update(&self, task: &Task) -> MeshResult<()>;

    /// 按 `order` 升序返回某任务的全部子任务
    async fn subtasks_of(&self, parent_id: &str) -> MeshResult<Vec<Task>>;

    /// 某队列上处于waiting_subtasks状态的任务，调度器内部轮询使用
    async fn waiting_on_queue(&self, queue_name: &str) -> MeshResult<Vec<Task>>;

    /// pingback_pending/expiration_pending仍为真的任务，重启恢复使用
    async fn with_pending_jobs(&self) -> MeshResult<Vec<Task>>;
}

/// 消息仓储抽象
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 插入新消息，id重复时返回Storage错误
    async fn insert(&self, message: &Message) -> MeshResult<()>;

    async fn get_by_id(&self, id: &str) -> MeshResult<Option<Message>>;

    /// 整行覆盖更新，消息不存在时返回MessageNotFound
    async fn update(&self, message: &Message) -> MeshResult<()>;

    /// 某任务名下的全部消息，按创建时间升序
    async fn get_by_task(&self, task_id: &str) -> MeshResult<Vec<Message>>;
}
