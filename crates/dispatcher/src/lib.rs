//! Taskmesh 任务引擎与调度器
//!
//! 驱动任务状态机的全部组件：动作注册表、安全门、出站消息流、
//! 任务引擎（含chord扇入）、延迟作业调度器和按任务id串行化的锁表。

pub mod engine;
pub mod locks;
pub mod registry;
pub mod scheduler;
pub mod security;
pub mod sender;

pub use engine::{HandlerOutcome, SubtaskSpec, TaskEngine, TaskSubmission};
pub use registry::{ActionHandler, ActionRegistry, HandlerOptions};
pub use scheduler::{JobBoard, JobKind, JobScheduler, SchedulerService};
pub use sender::MessageSender;

/// 发送方应用远端状态更新的保留动作名
pub const UPDATE_TASK_ACTION: &str = "taskmesh.update_task_status";
