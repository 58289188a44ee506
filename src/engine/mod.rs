//! Workflow execution: one runnable per instance, driven by its inbox.

pub mod events;
pub mod frontier;
pub mod retry;
mod runnable;

pub use events::{TaskExecutionEvent, WorkflowCommand, WorkflowEvent};
pub use frontier::Frontier;
pub use retry::{RetryPolicy, RetryStrategy};
pub use runnable::{EngineContext, EngineSettings, WorkflowExecutionRunnable};
