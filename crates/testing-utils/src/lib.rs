//! Taskmesh 共享测试工具
//!
//! 各crate测试共用的测试数据构造器与传输层mock。内存仓储直接复用
//! infrastructure里的实现，这里重导出以便测试统一从本crate取用。

pub mod builders;
pub mod mocks;

pub use builders::{MessageBuilder, TaskBuilder};
pub use mocks::MockTransport;
pub use taskmesh_infrastructure::{MemoryMessageRepository, MemoryTaskRepository};
