pub mod repository;
pub mod transport;

pub use repository::{MessageRepository, TaskRepository};
pub use transport::{DeliveryResponse, Transport};
