use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::Task;

/// 消息记录
///
/// 每一次入站/出站交换都会落一条不可变的消息记录：发送方/接收方端点
/// 与证书、动作、输入输出载荷、投递状态与时间戳。`output_status` 一旦
/// 写入即不再变更，消息保留用于审计与幂等重投检测——带相同id的重复
/// 入站消息会命中已存的记录而不会再次执行处理器。
///
/// 不变量：每条消息恰好归属于一个任务（`task_id`）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_url: String,
    pub receiver_url: String,
    pub sender_ssl_cert: String,
    pub receiver_ssl_cert: String,
    pub queue_name: String,
    pub action: String,
    pub is_received: bool,
    pub input_data: Option<Value>,
    pub input_async_data: Option<Value>,
    pub output_status: Option<u16>,
    pub created_date: DateTime<Utc>,
    pub pingback_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub info_text: Option<String>,
    pub task_id: String,
}

impl Message {
    /// 本节点发出的消息
    pub fn outbound(queue_name: String, action: String, task_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_url: String::new(),
            receiver_url: String::new(),
            sender_ssl_cert: String::new(),
            receiver_ssl_cert: String::new(),
            queue_name,
            action,
            is_received: false,
            input_data: None,
            input_async_data: None,
            output_status: None,
            created_date: Utc::now(),
            pingback_date: None,
            expiration_date: None,
            info_text: None,
            task_id,
        }
    }

    /// 从远端收到的消息，id沿用发送方生成的id以便幂等检测
    pub fn inbound(id: String, queue_name: String, action: String, task_id: String) -> Self {
        Self {
            id,
            sender_url: String::new(),
            receiver_url: String::new(),
            sender_ssl_cert: String::new(),
            receiver_ssl_cert: String::new(),
            queue_name,
            action,
            is_received: true,
            input_data: None,
            input_async_data: None,
            output_status: None,
            created_date: Utc::now(),
            pingback_date: None,
            expiration_date: None,
            info_text: None,
            task_id,
        }
    }

    /// 投递/处理结果是否已经定格
    pub fn is_processed(&self) -> bool {
        self.output_status.is_some()
    }

    /// 投递是否以2xx应答收尾；远端拒绝（非2xx）同样算未送达
    pub fn is_delivery_success(&self) -> bool {
        matches!(self.output_status, Some(status) if (200..300).contains(&status))
    }

    /// 序列化为对外JSON形态
    ///
    /// `full = true` 时内联归属任务，否则只携带 `task_id` 外键。
    pub fn to_value(&self, full: bool, task: Option<&Task>) -> Value {
        let mut ret = json!({
            "id": self.id,
            "action": self.action,
            "queue_name": self.queue_name,
            "sender_url": self.sender_url,
            "receiver_url": self.receiver_url,
            "is_received": self.is_received,
            "sender_ssl_cert": self.sender_ssl_cert,
            "receiver_ssl_cert": self.receiver_ssl_cert,
            "created_date": self.created_date,
            "input_data": self.input_data,
            "input_async_data": self.input_async_data,
            "output_status": self.output_status,
            "pingback_date": self.pingback_date,
            "expiration_date": self.expiration_date,
            "info_text": self.info_text,
        });
        if full {
            ret["task"] = task.map(|t| t.to_value(false, None)).unwrap_or(Value::Null);
        } else {
            ret["task_id"] = json!(self.task_id);
        }
        ret
    }
}
