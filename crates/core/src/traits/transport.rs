use async_trait::async_trait;
use serde_json::Value;

use crate::errors::MeshResult;

/// 一次投递的远端应答
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    pub status_code: u16,
    pub body: Value,
}

/// 传输层抽象
///
/// HTTP(S)传输与基于证书的双向认证是外部协作方，本trait只约定
/// "把JSON载荷送到目标URL并带回应答"这一能力。证书参数用于传输层
/// 建立双向TLS身份，身份校验本身不在这里发生。
#[async_trait]
pub trait Transport: Send + Sync {
    /// 投递JSON载荷，网络层失败（连接/超时/非法应答）返回Delivery错误；
    /// 远端以非2xx状态拒绝不算传输失败，状态码原样带回由调用方定夺。
    async fn deliver(
        &self,
        target_url: &str,
        payload: &Value,
        sender_cert: &str,
        receiver_cert: &str,
    ) -> MeshResult<DeliveryResponse>;
}
