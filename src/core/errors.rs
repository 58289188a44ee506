use std::fmt;
use thiserror::Error;

use crate::model::{TaskInstanceId, WorkflowInstanceId};

/// Unified error type for the master
#[derive(Debug, Error)]
pub enum MasterError {
    /// Invalid definition or settings, never retried
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Structural validation of a workflow definition or DAG
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// No alive worker in the requested group
    #[error("No host available in worker group '{worker_group}'")]
    NoHostAvailable { worker_group: String },

    /// The worker could not be reached or rejected the request
    #[error("Host {host} unreachable: {message}")]
    HostUnreachable { host: String, message: String },

    #[error("Dispatch to {host} timed out after {timeout_ms}ms")]
    DispatchTimeout { host: String, timeout_ms: u64 },

    #[error("Workflow instance {0} not found")]
    WorkflowNotFound(WorkflowInstanceId),

    #[error("Task instance {0} not found")]
    TaskInstanceNotFound(TaskInstanceId),

    /// A second runnable was offered for an id that already has one
    #[error("Workflow instance {0} already has an active runnable")]
    DuplicateInstance(WorkflowInstanceId),

    #[error("Invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Expression parse or evaluation failure
    #[error("Expression '{expression}' failed: {message}")]
    Expression { expression: String, message: String },

    #[error("Registry operation '{operation}' failed: {message}")]
    Registry { operation: String, message: String },

    #[error("Lock {path} is not held")]
    LockNotHeld { path: String },

    /// Database/persistence errors
    #[error("Database operation failed: {operation}")]
    Database {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Channel/messaging errors
    #[error("Channel error: {channel} - {message}")]
    Channel { channel: String, message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl MasterError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn no_host<S: Into<String>>(worker_group: S) -> Self {
        Self::NoHostAvailable {
            worker_group: worker_group.into(),
        }
    }

    pub fn host_unreachable<H: Into<String>, M: Into<String>>(host: H, message: M) -> Self {
        Self::HostUnreachable {
            host: host.into(),
            message: message.into(),
        }
    }

    pub fn invalid_transition(entity: &'static str, from: impl fmt::Debug, to: impl fmt::Debug) -> Self {
        Self::InvalidTransition {
            entity,
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }

    pub fn expression<E: Into<String>, M: Into<String>>(expression: E, message: M) -> Self {
        Self::Expression {
            expression: expression.into(),
            message: message.into(),
        }
    }

    pub fn registry<O: Into<String>, M: Into<String>>(operation: O, message: M) -> Self {
        Self::Registry {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a database error
    pub fn database<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Database {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create a channel error
    pub fn channel<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Errors raised while resolving or sending a task to a worker.
    pub fn is_dispatch_failure(&self) -> bool {
        matches!(
            self,
            Self::NoHostAvailable { .. } | Self::HostUnreachable { .. } | Self::DispatchTimeout { .. }
        )
    }

    /// Whether the task retry policy applies to this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NoHostAvailable { .. }
            | Self::HostUnreachable { .. }
            | Self::DispatchTimeout { .. }
            | Self::Channel { .. }
            | Self::Io { .. } => true,
            Self::Database { .. } => true,
            Self::Configuration { .. } | Self::Validation { .. } | Self::Expression { .. } => false,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::Validation { .. } => "validation",
            Self::NoHostAvailable { .. } | Self::HostUnreachable { .. } | Self::DispatchTimeout { .. } => {
                "dispatch"
            }
            Self::WorkflowNotFound(_) | Self::TaskInstanceNotFound(_) => "not_found",
            Self::DuplicateInstance(_) => "ownership",
            Self::InvalidTransition { .. } => "state",
            Self::Expression { .. } => "expression",
            Self::Registry { .. } | Self::LockNotHeld { .. } => "registry",
            Self::Database { .. } => "database",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Channel { .. } => "channel",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MasterError>;

impl From<std::io::Error> for MasterError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for MasterError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for MasterError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for MasterError {
    fn from(err: sled::Error) -> Self {
        Self::database("sled_operation", err)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for MasterError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::channel("mpsc", "receiver dropped")
    }
}

impl From<anyhow::Error> for MasterError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string())
    }
}
