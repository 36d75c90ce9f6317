//! Domain model (task id, task, status, snapshot).

pub mod ids;
pub mod task;

pub use ids::TaskId;
pub use task::{Payload, Task, TaskError, TaskSnapshot, TaskStatus};
