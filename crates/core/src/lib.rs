//! Taskmesh 核心抽象层
//!
//! 提供任务/消息数据模型、错误类型、仓储与传输层trait以及应用配置。
//! 所有其他crate都依赖本crate，本crate不依赖任何具体实现。

pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::AppConfig;
pub use errors::{MeshError, MeshResult};
