use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use taskmesh_core::config::TransportConfig;
use taskmesh_core::errors::{MeshError, MeshResult};
use taskmesh_core::traits::{DeliveryResponse, Transport};

/// 基于reqwest的HTTPS传输实现
///
/// 双向TLS的证书装配属于部署层配置，这里只负责把JSON载荷POST到
/// 目标URL并带回状态码与应答体。连接/超时/非JSON应答映射为Delivery
/// 错误；远端的非2xx状态码不算传输失败，原样返回。
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> MeshResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| MeshError::config_error(format!("构建HTTP客户端失败: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(
        &self,
        target_url: &str,
        payload: &Value,
        _sender_cert: &str,
        _receiver_cert: &str,
    ) -> MeshResult<DeliveryResponse> {
        debug!(target_url, "投递消息");

        let response = self
            .client
            .post(target_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                warn!(target_url, error = %e, "消息投递失败");
                MeshError::delivery_error(format!("POST {target_url} 失败: {e}"))
            })?;

        let status_code = response.status().as_u16();
        // 空应答体按null处理，不强求远端一定回JSON对象
        let body = response.json::<Value>().await.unwrap_or(Value::Null);

        debug!(target_url, status_code, "收到投递应答");
        Ok(DeliveryResponse { status_code, body })
    }
}
