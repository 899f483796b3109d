use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use taskmesh_core::errors::{MeshError, MeshResult};
use taskmesh_core::models::{Message, Task, TaskStatus};
use taskmesh_core::traits::{MessageRepository, TaskRepository};

/// 内存任务仓储
///
/// 面向嵌入式部署场景的任务存储实现。单个任务的读写在整表读写锁下
/// 完成，满足仓储trait要求的单任务ACID语义。终态任务保留在表中
/// 供追溯，不做物理删除。
#[derive(Debug, Default)]
pub struct MemoryTaskRepository {
    tasks: Arc<RwLock<HashMap<String, Task>>>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前任务总数（含终态归档任务）
    pub async fn count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn insert(&self, task: &Task) -> MeshResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(MeshError::storage_error(format!(
                "任务id重复: {}",
                task.id
            )));
        }
        debug!(task_id = %task.id, action = %task.action, "插入任务记录");
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> MeshResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update(&self, task: &Task) -> MeshResult<()> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task.id) {
            return Err(MeshError::task_not_found(task.id.clone()));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn subtasks_of(&self, parent_id: &str) -> MeshResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut subtasks: Vec<Task> = tasks
            .values()
            .filter(|t| t.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        subtasks.sort_by_key(|t| t.order);
        Ok(subtasks)
    }

    async fn waiting_on_queue(&self, queue_name: &str) -> MeshResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.status == TaskStatus::WaitingSubtasks && t.queue_name == queue_name)
            .cloned()
            .collect())
    }

    async fn with_pending_jobs(&self) -> MeshResult<Vec<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks
            .values()
            .filter(|t| t.pingback_pending || t.expiration_pending)
            .cloned()
            .collect())
    }
}

/// 内存消息仓储
#[derive(Debug, Default)]
pub struct MemoryMessageRepository {
    messages: Arc<RwLock<HashMap<String, Message>>>,
}

impl MemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.messages.read().await.len()
    }
}

#[async_trait]
impl MessageRepository for MemoryMessageRepository {
    async fn insert(&self, message: &Message) -> MeshResult<()> {
        let mut messages = self.messages.write().await;
        if messages.contains_key(&message.id) {
            return Err(MeshError::storage_error(format!(
                "消息id重复: {}",
                message.id
            )));
        }
        debug!(message_id = %message.id, action = %message.action, "插入消息记录");
        messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> MeshResult<Option<Message>> {
        Ok(self.messages.read().await.get(id).cloned())
    }

    async fn update(&self, message: &Message) -> MeshResult<()> {
        let mut messages = self.messages.write().await;
        if !messages.contains_key(&message.id) {
            return Err(MeshError::message_not_found(message.id.clone()));
        }
        messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get_by_task(&self, task_id: &str) -> MeshResult<Vec<Message>> {
        let messages = self.messages.read().await;
        let mut ret: Vec<Message> = messages
            .values()
            .filter(|m| m.task_id == task_id)
            .cloned()
            .collect();
        ret.sort_by_key(|m| m.created_date);
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_core::models::TaskType;

    #[tokio::test]
    async fn test_task_insert_and_duplicate() {
        let repo = MemoryTaskRepository::new();
        let task = Task::new(TaskType::Simple, "a".into(), "q".into());

        repo.insert(&task).await.unwrap();
        assert!(repo.get_by_id(&task.id).await.unwrap().is_some());

        // 重复插入同一id报存储错误
        let err = repo.insert(&task).await.unwrap_err();
        assert!(matches!(err, MeshError::Storage(_)));
    }

    #[tokio::test]
    async fn test_subtasks_ordered_by_order() {
        let repo = MemoryTaskRepository::new();
        let parent = Task::new(TaskType::Chord, "p".into(), "q".into());
        repo.insert(&parent).await.unwrap();

        // 乱序插入，读取时按order排序
        for order in [2, 0, 1] {
            let mut sub = Task::new(TaskType::Simple, "s".into(), "q".into());
            sub.parent_id = Some(parent.id.clone());
            sub.order = Some(order);
            repo.insert(&sub).await.unwrap();
        }

        let subs = repo.subtasks_of(&parent.id).await.unwrap();
        let orders: Vec<i32> = subs.iter().filter_map(|t| t.order).collect();
        assert_eq!(orders, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let repo = MemoryTaskRepository::new();
        let task = Task::new(TaskType::Simple, "a".into(), "q".into());
        let err = repo.update(&task).await.unwrap_err();
        assert!(matches!(err, MeshError::TaskNotFound { .. }));
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let repo = MemoryMessageRepository::new();
        let msg = Message::outbound("q".into(), "a".into(), "t1".into());
        repo.insert(&msg).await.unwrap();

        let mut stored = repo.get_by_id(&msg.id).await.unwrap().unwrap();
        stored.output_status = Some(200);
        repo.update(&stored).await.unwrap();

        let by_task = repo.get_by_task("t1").await.unwrap();
        assert_eq!(by_task.len(), 1);
        assert_eq!(by_task[0].output_status, Some(200));
    }
}
