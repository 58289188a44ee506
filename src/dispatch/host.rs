use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::errors::{MasterError, Result};
use crate::registry::{paths, Registry, RegistryEvent, RegistryEventKind, ServerStatus, WorkerHeartbeat};

/// An alive worker
#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub address: String,
    pub worker_group: String,
    pub heartbeat: Option<WorkerHeartbeat>,
}

impl Host {
    pub fn new(address: impl Into<String>, worker_group: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            worker_group: worker_group.into(),
            heartbeat: None,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: WorkerHeartbeat) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn is_busy(&self) -> bool {
        self.heartbeat
            .as_ref()
            .map_or(false, |hb| hb.server_status == ServerStatus::Busy)
    }

    /// Lower is better. Hosts without a heartbeat sit in the middle.
    fn load_score(&self) -> f64 {
        match &self.heartbeat {
            Some(hb) => {
                let raw = hb.cpu_usage * 0.4 + hb.memory_usage * 0.3 + hb.load_average * 0.3;
                raw * 100.0 / f64::from(hb.host_weight.max(1))
            }
            None => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HostSelectorKind {
    Random,
    RoundRobin,
    #[default]
    LowerWeight,
}

pub trait HostSelector: Send + Sync {
    /// Pick one of `candidates`, which is never empty.
    fn select(&self, candidates: &[Host]) -> Host;
}

pub struct RandomSelector;

impl HostSelector for RandomSelector {
    fn select(&self, candidates: &[Host]) -> Host {
        candidates[fastrand::usize(..candidates.len())].clone()
    }
}

#[derive(Default)]
pub struct RoundRobinSelector {
    next: AtomicUsize,
}

impl HostSelector for RoundRobinSelector {
    fn select(&self, candidates: &[Host]) -> Host {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[index].clone()
    }
}

pub struct LowerWeightSelector;

impl HostSelector for LowerWeightSelector {
    fn select(&self, candidates: &[Host]) -> Host {
        let mut best = &candidates[0];
        for host in &candidates[1..] {
            if host.load_score() < best.load_score() {
                best = host;
            }
        }
        best.clone()
    }
}

pub fn selector_for(kind: HostSelectorKind) -> Box<dyn HostSelector> {
    match kind {
        HostSelectorKind::Random => Box::new(RandomSelector),
        HostSelectorKind::RoundRobin => Box::new(RoundRobinSelector::default()),
        HostSelectorKind::LowerWeight => Box::new(LowerWeightSelector),
    }
}

/// Worker group -> alive hosts, mirrored from the registry.
#[derive(Debug, Default)]
pub struct WorkerDirectory {
    groups: DashMap<String, BTreeMap<String, Host>>,
}

impl WorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, host: Host) {
        self.groups
            .entry(host.worker_group.clone())
            .or_default()
            .insert(host.address.clone(), host);
    }

    pub fn remove(&self, group: &str, address: &str) -> bool {
        self.groups
            .get_mut(group)
            .map_or(false, |mut hosts| hosts.remove(address).is_some())
    }

    /// Hosts of `group` sorted by address.
    pub fn hosts(&self, group: &str) -> Vec<Host> {
        self.groups
            .get(group)
            .map(|hosts| hosts.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.groups.iter().any(|g| g.contains_key(address))
    }

    fn host_from_entry(group: &str, address: &str, value: Option<&str>) -> Host {
        let host = Host::new(address, group);
        match value.map(WorkerHeartbeat::from_json) {
            Some(Ok(heartbeat)) => host.with_heartbeat(heartbeat),
            Some(Err(e)) => {
                warn!(worker = %address, error = %e, "Ignoring unreadable worker heartbeat");
                host
            }
            None => host,
        }
    }

    /// Replace the directory contents with what the registry holds now.
    pub async fn refresh(&self, registry: &dyn Registry) -> Result<usize> {
        let mut fresh: BTreeMap<String, BTreeMap<String, Host>> = BTreeMap::new();
        for group in registry.children(paths::WORKER_ROOT).await? {
            for address in registry.children(&paths::worker_group_path(&group)).await? {
                let value = registry.get(&paths::worker_path(&group, &address)).await?;
                let host = Self::host_from_entry(&group, &address, value.as_deref());
                fresh.entry(group.clone()).or_default().insert(address, host);
            }
        }
        let count = fresh.values().map(BTreeMap::len).sum();
        self.groups.retain(|group, _| fresh.contains_key(group));
        for (group, hosts) in fresh {
            self.groups.insert(group, hosts);
        }
        info!(workers = count, "Worker directory refreshed");
        Ok(count)
    }

    /// Apply one registry event. Returns the removed host on deregistration.
    pub fn apply(&self, event: &RegistryEvent) -> Option<Host> {
        let (group, address) = paths::parse_worker_path(&event.path)?;
        match event.kind {
            RegistryEventKind::Added | RegistryEventKind::Updated => {
                debug!(%group, worker = %address, "Worker registered");
                self.upsert(Self::host_from_entry(group, address, event.value.as_deref()));
                None
            }
            RegistryEventKind::Removed => {
                let removed = self.remove(group, address);
                if removed {
                    info!(%group, worker = %address, "Worker deregistered");
                }
                removed.then(|| Host::new(address, group))
            }
        }
    }
}

/// Chooses a host of a worker group with the configured strategy.
pub struct HostManager {
    directory: Arc<WorkerDirectory>,
    selector: Box<dyn HostSelector>,
}

impl HostManager {
    pub fn new(directory: Arc<WorkerDirectory>, kind: HostSelectorKind) -> Self {
        Self {
            directory,
            selector: selector_for(kind),
        }
    }

    pub fn directory(&self) -> &Arc<WorkerDirectory> {
        &self.directory
    }

    /// Select an alive, non-busy host of `worker_group`, never one in `exclude`.
    pub fn select(&self, worker_group: &str, exclude: &[String]) -> Result<Host> {
        let candidates: Vec<Host> = self
            .directory
            .hosts(worker_group)
            .into_iter()
            .filter(|h| !h.is_busy() && !exclude.contains(&h.address))
            .collect();
        if candidates.is_empty() {
            return Err(MasterError::no_host(worker_group));
        }
        Ok(self.selector.select(&candidates))
    }
}
