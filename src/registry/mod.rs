//! Service registry abstraction: node discovery, ephemeral registration,
//! prefix subscriptions and distributed locks.

mod memory;
pub mod paths;

pub use memory::MemoryRegistry;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{MasterError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryEventKind {
    Added,
    Updated,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    pub path: String,
    pub value: Option<String>,
}

/// Registry events under one prefix.
pub struct Subscription {
    prefix: String,
    receiver: async_broadcast::Receiver<RegistryEvent>,
}

impl Subscription {
    pub fn new(prefix: impl Into<String>, receiver: async_broadcast::Receiver<RegistryEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            receiver,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Next matching event, `None` once the registry is gone. Lagging
    /// subscribers skip the overflowed events.
    pub async fn recv(&mut self) -> Option<RegistryEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if paths::is_under(&event.path, &self.prefix) => return Some(event),
                Ok(_) => continue,
                Err(async_broadcast::RecvError::Overflowed(skipped)) => {
                    tracing::warn!(prefix = %self.prefix, skipped, "Registry subscription lagged");
                    continue;
                }
                Err(async_broadcast::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Names of the direct children of `path`
    async fn children(&self, path: &str) -> Result<Vec<String>>;

    async fn get(&self, path: &str) -> Result<Option<String>>;

    /// Ephemeral entries vanish with the session that created them
    async fn put(&self, path: &str, value: &str, ephemeral: bool) -> Result<()>;

    async fn delete(&self, path: &str) -> Result<()>;

    async fn subscribe(&self, prefix: &str) -> Result<Subscription>;

    /// Try to take the lock; `false` when someone else holds it
    async fn acquire_lock(&self, path: &str) -> Result<bool>;

    async fn release_lock(&self, path: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerStatus {
    #[default]
    Normal,
    /// Alive but refusing new tasks
    Busy,
}

/// Value published by workers under `/nodes/worker/{group}/{host}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerHeartbeat {
    pub host: String,
    pub worker_group: String,
    #[serde(default)]
    pub cpu_usage: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub load_average: f64,
    #[serde(default = "default_weight")]
    pub host_weight: u32,
    #[serde(default)]
    pub server_status: ServerStatus,
    pub report_time: DateTime<Utc>,
}

fn default_weight() -> u32 {
    100
}

impl WorkerHeartbeat {
    pub fn new(host: impl Into<String>, worker_group: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            worker_group: worker_group.into(),
            cpu_usage: 0.0,
            memory_usage: 0.0,
            load_average: 0.0,
            host_weight: default_weight(),
            server_status: ServerStatus::Normal,
            report_time: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| MasterError::registry("parse worker heartbeat", e.to_string()))
    }
}

/// Value published by masters under `/nodes/master/{host}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterHeartbeat {
    pub host: String,
    pub start_time: DateTime<Utc>,
    pub report_time: DateTime<Utc>,
    pub active_workflows: usize,
}
