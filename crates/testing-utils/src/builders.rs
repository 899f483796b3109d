//! 测试数据构造器：带合理默认值，按需覆盖个别字段

use chrono::{DateTime, Utc};
use serde_json::Value;

use taskmesh_core::models::{Message, Task, TaskStatus, TaskType};

pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        let mut task = Task::new(
            TaskType::Simple,
            "test_action".to_string(),
            "test_queue".to_string(),
        );
        task.sender_url = "https://sender.example/api/queues".to_string();
        task.receiver_url = "https://receiver.example/api/queues".to_string();
        task.sender_ssl_cert = "SENDER-CERT".to_string();
        task.receiver_ssl_cert = "RECEIVER-CERT".to_string();
        Self { task }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn with_type(mut self, task_type: TaskType) -> Self {
        self.task.task_type = task_type;
        self
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.task.action = action.to_string();
        self
    }

    pub fn with_queue(mut self, queue: &str) -> Self {
        self.task.queue_name = queue.to_string();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_parent(mut self, parent_id: &str, order: i32) -> Self {
        self.task.parent_id = Some(parent_id.to_string());
        self.task.order = Some(order);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.task.input_data = Some(input);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.task.output_data = Some(output);
        self
    }

    pub fn with_expiration(mut self, due: DateTime<Utc>) -> Self {
        self.task.expiration_date = Some(due);
        self.task.expiration_pending = true;
        self
    }

    /// 接收端任务（received状态）
    pub fn received(mut self) -> Self {
        self.task.is_received = true;
        self.task.status = TaskStatus::Received;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn new(task_id: &str) -> Self {
        let mut message = Message::outbound(
            "test_queue".to_string(),
            "test_action".to_string(),
            task_id.to_string(),
        );
        message.sender_url = "https://sender.example/api/queues".to_string();
        message.receiver_url = "https://receiver.example/api/queues".to_string();
        Self { message }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.message.id = id.to_string();
        self
    }

    pub fn with_action(mut self, action: &str) -> Self {
        self.message.action = action.to_string();
        self
    }

    pub fn inbound(mut self) -> Self {
        self.message.is_received = true;
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.message.input_data = Some(input);
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}
