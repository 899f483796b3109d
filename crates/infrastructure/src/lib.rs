//! Taskmesh 基础设施层
//!
//! 仓储trait的内存实现（嵌入式部署）和基于reqwest的HTTPS传输实现。

pub mod http_transport;
pub mod memory;

pub use http_transport::HttpTransport;
pub use memory::{MemoryMessageRepository, MemoryTaskRepository};
