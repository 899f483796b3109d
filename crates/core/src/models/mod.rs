pub mod message;
pub mod task;

pub use message::Message;
pub use task::{Task, TaskBehavior, TaskStatus, TaskType};
