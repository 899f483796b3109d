//! 传输层mock：记录每次投递并按脚本返回应答

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use taskmesh_core::errors::{MeshError, MeshResult};
use taskmesh_core::traits::{DeliveryResponse, Transport};

/// 一次被记录的投递
#[derive(Debug, Clone)]
pub struct RecordedDelivery {
    pub target_url: String,
    pub payload: Value,
}

/// 内存传输mock
///
/// 默认对所有投递返回200/null。`fail_next_deliveries` 可以让接下来
/// 的N次投递报传输错误，`respond_with_status` 改变远端应答状态码，
/// `delay_deliveries` 给每次投递加上人为延迟（模拟在途消息交错）。
#[derive(Default)]
pub struct MockTransport {
    deliveries: Mutex<Vec<RecordedDelivery>>,
    fail_remaining: Mutex<u32>,
    response_status: Mutex<Option<u16>>,
    delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来count次投递失败（传输层错误）
    pub fn fail_next_deliveries(&self, count: u32) {
        *self.fail_remaining.lock().unwrap() = count;
    }

    /// 之后的投递都返回该状态码
    pub fn respond_with_status(&self, status: u16) {
        *self.response_status.lock().unwrap() = Some(status);
    }

    /// 之后的每次投递先等待该时长再返回
    pub fn delay_deliveries(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn delivery_count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    /// 发往某动作的投递载荷
    pub fn deliveries_for_action(&self, action: &str) -> Vec<Value> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.payload["action"] == Value::String(action.to_string()))
            .map(|d| d.payload.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn deliver(
        &self,
        target_url: &str,
        payload: &Value,
        _sender_cert: &str,
        _receiver_cert: &str,
    ) -> MeshResult<DeliveryResponse> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut remaining = self.fail_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(MeshError::delivery_error(format!(
                    "mock: 投递 {target_url} 失败"
                )));
            }
        }

        self.deliveries.lock().unwrap().push(RecordedDelivery {
            target_url: target_url.to_string(),
            payload: payload.clone(),
        });

        let status_code = self.response_status.lock().unwrap().unwrap_or(200);
        Ok(DeliveryResponse {
            status_code,
            body: Value::Null,
        })
    }
}
