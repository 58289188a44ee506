// Core infrastructure shared by every part of the master
pub mod core {
    pub mod config;
    pub mod errors;
    pub mod logging;
}

pub mod model;     // Definitions, instances and their status machines
pub mod dag;       // Validated DAG view plus branch overlay
pub mod logic;     // Switch / blocking / dependent / conditions executors
pub mod engine;    // Per-instance workflow runnables
pub mod dispatch;  // Host selection and worker RPC
pub mod cache;     // Instance ownership and task routing
pub mod registry;  // Coordination registry (nodes, locks)
pub mod storage;   // Persistence of definitions and instances
pub mod failover;  // Worker and master failure handling
pub mod master;    // The master server itself

// Re-exports for convenience
pub use core::config::MasterConfig;
pub use core::errors::{MasterError, Result};
pub use core::logging::init_tracing;
pub use dag::WorkflowDag;
pub use dispatch::{DispatchAck, DispatchRequest, Host, HostSelectorKind, WorkerClient};
pub use engine::{RetryStrategy, TaskExecutionEvent, WorkflowCommand};
pub use master::{MasterCommand, MasterServer};
pub use model::{
    FailureStrategy, ParamPool, TaskDefinition, TaskInstance, TaskStatus, WorkflowDefinition, WorkflowInstance,
    WorkflowStatus,
};
pub use registry::{MemoryRegistry, Registry};
pub use storage::{MemoryStorage, Persistence, SledStorage};
