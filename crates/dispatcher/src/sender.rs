use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use taskmesh_core::config::NodeConfig;
use taskmesh_core::errors::MeshResult;
use taskmesh_core::models::Message;
use taskmesh_core::traits::{MessageRepository, Transport};

/// 一条待发送的出站消息
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub queue_name: String,
    pub action: String,
    pub receiver_url: String,
    pub receiver_ssl_cert: String,
    pub input_data: Option<Value>,
    pub input_async_data: Option<Value>,
    pub task_id: String,
    pub pingback_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    /// 附加进线上信封的额外字段（例如任务分发时的task_type）
    pub extra: Map<String, Value>,
}

/// 出站消息流
///
/// 构造并持久化出站消息记录，委托传输层投递，并把应答状态写回
/// 消息行。消息行是投递是否成功的唯一事实来源。
pub struct MessageSender {
    message_repo: Arc<dyn MessageRepository>,
    transport: Arc<dyn Transport>,
    node: NodeConfig,
}

impl MessageSender {
    pub fn new(
        message_repo: Arc<dyn MessageRepository>,
        transport: Arc<dyn Transport>,
        node: NodeConfig,
    ) -> Self {
        Self {
            message_repo,
            transport,
            node,
        }
    }

    pub fn node(&self) -> &NodeConfig {
        &self.node
    }

    /// 发送一条消息
    ///
    /// 先落消息记录再做网络I/O。投递成功时把远端状态码写入
    /// `output_status`；传输失败时在 `info_text` 记录原因并返回
    /// Delivery错误，消息保持未处理状态以便重发。
    pub async fn send(&self, out: OutboundMessage) -> MeshResult<Message> {
        let mut message = Message::outbound(
            out.queue_name.clone(),
            out.action.clone(),
            out.task_id.clone(),
        );
        message.sender_url = self.node.node_url.clone();
        message.sender_ssl_cert = self.node.ssl_cert.clone();
        message.receiver_url = out.receiver_url.clone();
        message.receiver_ssl_cert = out.receiver_ssl_cert.clone();
        message.input_data = out.input_data.clone();
        message.input_async_data = out.input_async_data.clone();
        message.pingback_date = out.pingback_date;
        message.expiration_date = out.expiration_date;

        self.message_repo.insert(&message).await?;

        let payload = self.build_envelope(&message, &out.extra);
        let target_url = format!("{}/{}", out.receiver_url.trim_end_matches('/'), out.queue_name);

        match self
            .transport
            .deliver(
                &target_url,
                &payload,
                &self.node.ssl_cert,
                &out.receiver_ssl_cert,
            )
            .await
        {
            Ok(response) => {
                message.output_status = Some(response.status_code);
                self.message_repo.update(&message).await?;
                info!(
                    message_id = %message.id,
                    action = %message.action,
                    status = response.status_code,
                    "消息投递完成"
                );
                Ok(message)
            }
            Err(e) => {
                message.info_text = Some(e.to_string());
                self.message_repo.update(&message).await?;
                warn!(message_id = %message.id, action = %message.action, error = %e, "消息投递失败");
                Err(e)
            }
        }
    }

    /// 线上JSON信封
    fn build_envelope(&self, message: &Message, extra: &Map<String, Value>) -> Value {
        let mut envelope = json!({
            "id": message.id,
            "action": message.action,
            "queue_name": message.queue_name,
            "sender_url": message.sender_url,
            "receiver_url": message.receiver_url,
            "sender_ssl_cert": message.sender_ssl_cert,
            "input_data": message.input_data,
            "input_async_data": message.input_async_data,
            "pingback_date": message.pingback_date,
            "expiration_date": message.expiration_date,
            "task_id": message.task_id,
        });
        if let Value::Object(map) = &mut envelope {
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }
        envelope
    }
}
