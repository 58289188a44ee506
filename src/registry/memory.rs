use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use tracing::debug;

use super::{Registry, RegistryEvent, RegistryEventKind, Subscription};
use crate::core::errors::{MasterError, Result};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    ephemeral: bool,
}

/// In-process registry. Shared between several masters in one process it
/// behaves like a single external registry cluster.
pub struct MemoryRegistry {
    entries: DashMap<String, Entry>,
    locks: DashMap<String, ()>,
    sender: async_broadcast::Sender<RegistryEvent>,
    keepalive: async_broadcast::InactiveReceiver<RegistryEvent>,
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (mut sender, receiver) = async_broadcast::broadcast(EVENT_CAPACITY);
        sender.set_overflow(true);
        Self {
            entries: DashMap::new(),
            locks: DashMap::new(),
            sender,
            keepalive: receiver.deactivate(),
        }
    }

    fn publish(&self, kind: RegistryEventKind, path: &str, value: Option<String>) {
        let event = RegistryEvent {
            kind,
            path: path.to_string(),
            value,
        };
        // no active subscriber is fine
        let _ = self.sender.try_broadcast(event);
    }

    /// Drop an ephemeral entry as if its owner's session ended.
    pub fn expire(&self, path: &str) -> bool {
        let removed = self
            .entries
            .remove_if(path, |_, entry| entry.ephemeral)
            .is_some();
        if removed {
            debug!(%path, "Ephemeral registry entry expired");
            self.publish(RegistryEventKind::Removed, path, None);
        }
        removed
    }

    pub fn is_locked(&self, path: &str) -> bool {
        self.locks.contains_key(path)
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn children(&self, path: &str) -> Result<Vec<String>> {
        let base = path.trim_end_matches('/');
        let names: BTreeSet<String> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let rest = entry.key().strip_prefix(base)?.strip_prefix('/')?;
                rest.split('/').next().filter(|s| !s.is_empty()).map(str::to_string)
            })
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn get(&self, path: &str) -> Result<Option<String>> {
        Ok(self.entries.get(path).map(|e| e.value.clone()))
    }

    async fn put(&self, path: &str, value: &str, ephemeral: bool) -> Result<()> {
        if !path.starts_with('/') {
            return Err(MasterError::registry("put", format!("path '{}' must be absolute", path)));
        }
        let previous = self.entries.insert(
            path.to_string(),
            Entry {
                value: value.to_string(),
                ephemeral,
            },
        );
        let kind = if previous.is_some() {
            RegistryEventKind::Updated
        } else {
            RegistryEventKind::Added
        };
        self.publish(kind, path, Some(value.to_string()));
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        if self.entries.remove(path).is_some() {
            self.publish(RegistryEventKind::Removed, path, None);
        }
        Ok(())
    }

    async fn subscribe(&self, prefix: &str) -> Result<Subscription> {
        Ok(Subscription::new(prefix, self.keepalive.activate_cloned()))
    }

    async fn acquire_lock(&self, path: &str) -> Result<bool> {
        let acquired = match self.locks.entry(path.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        };
        debug!(%path, acquired, "Lock attempt");
        Ok(acquired)
    }

    async fn release_lock(&self, path: &str) -> Result<()> {
        match self.locks.remove(path) {
            Some(_) => Ok(()),
            None => Err(MasterError::LockNotHeld { path: path.to_string() }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::paths;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_children_and_get() {
        let registry = MemoryRegistry::new();
        registry.put(&paths::worker_path("etl", "w1:1"), "{}", true).await.unwrap();
        registry.put(&paths::worker_path("etl", "w2:1"), "{}", true).await.unwrap();
        registry.put(&paths::worker_path("ml", "w3:1"), "{}", true).await.unwrap();

        assert_eq!(registry.children(paths::WORKER_ROOT).await.unwrap(), vec!["etl", "ml"]);
        assert_eq!(
            registry.children(&paths::worker_group_path("etl")).await.unwrap(),
            vec!["w1:1", "w2:1"]
        );
        assert_eq!(registry.get(&paths::worker_path("ml", "w3:1")).await.unwrap(), Some("{}".into()));
        assert!(registry.put("relative", "x", false).await.is_err());
    }

    #[tokio::test]
    async fn test_subscription_filters_by_prefix() {
        let registry = MemoryRegistry::new();
        let mut workers = registry.subscribe(paths::WORKER_ROOT).await.unwrap();

        registry.put(&paths::master_path("m1"), "{}", true).await.unwrap();
        registry.put(&paths::worker_path("etl", "w1"), "{}", true).await.unwrap();
        assert!(registry.expire(&paths::worker_path("etl", "w1")));

        let added = workers.recv().await.unwrap();
        assert_eq!(added.kind, RegistryEventKind::Added);
        assert_eq!(added.path, "/nodes/worker/etl/w1");
        let removed = workers.recv().await.unwrap();
        assert_eq!(removed.kind, RegistryEventKind::Removed);
    }

    #[tokio::test]
    async fn test_persistent_entries_do_not_expire() {
        let registry = MemoryRegistry::new();
        registry.put("/config/a", "1", false).await.unwrap();
        assert!(!registry.expire("/config/a"));
        assert_eq!(registry.get("/config/a").await.unwrap(), Some("1".into()));
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let registry = Arc::new(MemoryRegistry::new());
        let path = paths::master_failover_lock("m1");

        let mut handles = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move { registry.acquire_lock(&path).await.unwrap() }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);

        registry.release_lock(&path).await.unwrap();
        assert!(registry.release_lock(&path).await.is_err());
        assert!(registry.acquire_lock(&path).await.unwrap());
    }
}
