//! Asynchronous task execution.

mod engine;
pub mod executor;
mod types;

pub use engine::{PreparedTask, TaskEngine, TaskEngineConfig};
pub use executor::{ExecutionError, ExecutorRegistry, ScriptExecutor, TaskExecutor};
pub use types::{TaskStatus, TaskType, TaskView};
