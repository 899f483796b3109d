use thiserror::Error;

use crate::models::TaskStatus;

/// 框架统一错误类型
///
/// 错误分为三类：启动期致命错误（配置类）、会被调度器重试的瞬时错误
/// （投递、存储类）以及写入任务/消息状态字段供调用方观察的业务错误。
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("安全校验失败: 发送方证书与本地期望证书不匹配")]
    SecurityViolation,
    #[error("未注册的动作: {action} (队列: {queue})")]
    UnknownAction { action: String, queue: String },
    #[error("消息投递失败: {0}")]
    Delivery(String),
    #[error("处理器执行失败: {0}")]
    Domain(String),
    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },
    #[error("消息未找到: {id}")]
    MessageNotFound { id: String },
    #[error("非法的状态迁移: {from:?} -> {to:?}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },
    #[error("存储错误: {0}")]
    Storage(String),
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type MeshResult<T> = Result<T, MeshError>;

impl MeshError {
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn delivery_error<S: Into<String>>(msg: S) -> Self {
        Self::Delivery(msg.into())
    }
    pub fn domain_error<S: Into<String>>(msg: S) -> Self {
        Self::Domain(msg.into())
    }
    pub fn storage_error<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn message_not_found<S: Into<String>>(id: S) -> Self {
        Self::MessageNotFound { id: id.into() }
    }
    pub fn unknown_action<S: Into<String>>(action: S, queue: S) -> Self {
        Self::UnknownAction {
            action: action.into(),
            queue: queue.into(),
        }
    }

    /// 瞬时错误，由调度器按退避策略重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, MeshError::Delivery(_) | MeshError::Storage(_))
    }

    /// 致命错误，进程启动阶段出现时直接中止
    pub fn is_fatal(&self) -> bool {
        matches!(self, MeshError::Configuration(_) | MeshError::Internal(_))
    }

    /// 作为消息投递结果写回的HTTP等价状态码
    pub fn status_code(&self) -> u16 {
        match self {
            MeshError::SecurityViolation => 403,
            MeshError::UnknownAction { .. } => 404,
            MeshError::TaskNotFound { .. } | MeshError::MessageNotFound { .. } => 404,
            MeshError::Domain(_) => 500,
            MeshError::InvalidTransition { .. } => 409,
            _ => 500,
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for MeshError {
    fn from(err: anyhow::Error) -> Self {
        MeshError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(MeshError::delivery_error("连接超时").is_retryable());
        assert!(MeshError::storage_error("写入失败").is_retryable());
        assert!(!MeshError::SecurityViolation.is_retryable());

        assert!(MeshError::config_error("缺少node_url").is_fatal());
        assert!(!MeshError::task_not_found("t1").is_fatal());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(MeshError::SecurityViolation.status_code(), 403);
        assert_eq!(
            MeshError::unknown_action("a", "q").status_code(),
            404
        );
        assert_eq!(MeshError::domain_error("业务失败").status_code(), 500);
    }
}
