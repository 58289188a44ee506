//! Reaction to nodes leaving the registry.
//!
//! A deregistered worker costs its in-flight tasks: every cached runnable is
//! told and moves the affected attempts through NEED_FAULT_TOLERANCE. A
//! deregistered master costs its workflow instances: one surviving master
//! takes the failover lock for it, re-homes the persisted rows and asks its
//! own master loop to rebuild a runnable per instance.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::InstanceCache;
use crate::core::errors::{MasterError, Result};
use crate::dispatch::{TaskDispatcher, WorkerDirectory};
use crate::engine::WorkflowEvent;
use crate::logic::LogicTaskRegistry;
use crate::master::MasterCommand;
use crate::model::{TaskInstance, TaskStatus, WorkflowInstanceId, WorkflowStatus};
use crate::registry::{paths, Registry, RegistryEvent, RegistryEventKind, Subscription};
use crate::storage::Persistence;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct FailoverCoordinator {
    master_host: String,
    registry: Arc<dyn Registry>,
    storage: Arc<dyn Persistence>,
    directory: Arc<WorkerDirectory>,
    dispatcher: Arc<TaskDispatcher>,
    logic: LogicTaskRegistry,
    cache: Arc<InstanceCache>,
    commands: mpsc::Sender<MasterCommand>,
    lock_timeout: Duration,
}

impl FailoverCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        master_host: impl Into<String>,
        registry: Arc<dyn Registry>,
        storage: Arc<dyn Persistence>,
        directory: Arc<WorkerDirectory>,
        dispatcher: Arc<TaskDispatcher>,
        logic: LogicTaskRegistry,
        cache: Arc<InstanceCache>,
        commands: mpsc::Sender<MasterCommand>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            master_host: master_host.into(),
            registry,
            storage,
            directory,
            dispatcher,
            logic,
            cache,
            commands,
            lock_timeout,
        }
    }

    /// Follow `/nodes` until the subscription closes or `shutdown` fires.
    /// The worker directory is kept in sync from the same stream.
    pub fn spawn(self: Arc<Self>, mut subscription: Subscription, shutdown: Arc<Notify>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(prefix = subscription.prefix(), "Failover coordinator started");
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        info!("Failover coordinator shutting down");
                        break;
                    }
                    event = subscription.recv() => match event {
                        Some(event) => self.handle_event(&event).await,
                        None => {
                            warn!("Registry subscription closed, failover coordinator exits");
                            break;
                        }
                    },
                }
            }
        })
    }

    pub async fn handle_event(&self, event: &RegistryEvent) {
        if paths::parse_worker_path(&event.path).is_some() {
            if let Some(host) = self.directory.apply(event) {
                self.failover_worker(&host.address).await;
            }
            return;
        }
        if event.kind != RegistryEventKind::Removed {
            return;
        }
        let Some(dead) = paths::parse_master_path(&event.path) else {
            return;
        };
        if dead == self.master_host {
            warn!("Own master registration vanished");
            return;
        }
        match self.failover_master(dead).await {
            Ok(recovered) => {
                for id in recovered {
                    if self.commands.send(MasterCommand::RecoverWorkflow(id)).await.is_err() {
                        warn!(workflow_instance_id = id, "Master loop gone, recovery dropped");
                    }
                }
            }
            Err(e) => error!(dead_master = %dead, error = %e, category = e.category(), "Master failover failed"),
        }
    }

    /// Tell every cached runnable that `host` is gone. Returns how many
    /// runnables were reached.
    pub async fn failover_worker(&self, host: &str) -> usize {
        let reached = self.cache.broadcast(WorkflowEvent::WorkerLost { host: host.to_string() });
        info!(worker = %host, runnables = reached, "Worker failover broadcast");
        reached
    }

    /// Take over every unfinished instance of `dead`. Returns the instances
    /// that need a runnable on this master; parked ones are only re-homed.
    #[instrument(skip(self))]
    pub async fn failover_master(&self, dead: &str) -> Result<Vec<WorkflowInstanceId>> {
        let lock = paths::master_failover_lock(dead);
        self.acquire_lock(&lock).await?;
        let result = self.take_over_instances(dead).await;
        if let Err(e) = self.registry.release_lock(&lock).await {
            warn!(%lock, error = %e, "Failed to release failover lock");
        }
        result
    }

    async fn acquire_lock(&self, path: &str) -> Result<()> {
        let started = Instant::now();
        loop {
            if self.registry.acquire_lock(path).await? {
                debug!(%path, "Failover lock acquired");
                return Ok(());
            }
            if started.elapsed() >= self.lock_timeout {
                return Err(MasterError::registry(
                    "acquire_lock",
                    format!("{} still held after {:?}", path, self.lock_timeout),
                ));
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn take_over_instances(&self, dead: &str) -> Result<Vec<WorkflowInstanceId>> {
        let instances = self.storage.workflow_instances_by_host(dead).await?;
        if instances.is_empty() {
            debug!(dead_master = %dead, "Nothing to fail over");
            return Ok(Vec::new());
        }

        let mut recovered = Vec::with_capacity(instances.len());
        for mut instance in instances {
            for mut task in self.storage.valid_task_instances(instance.id).await? {
                if self.recover_task(&mut task, dead).await {
                    self.storage.save_task_instance(&task).await?;
                }
            }

            instance.host = Some(self.master_host.clone());
            if matches!(instance.status, WorkflowStatus::Submitted | WorkflowStatus::Running) {
                instance.transition_to(WorkflowStatus::NeedFaultTolerance)?;
            }
            self.storage.save_workflow_instance(&instance).await?;

            if !instance.status.is_finished() {
                recovered.push(instance.id);
            }
            info!(
                workflow_instance_id = instance.id,
                status = %instance.status,
                dead_master = %dead,
                "Workflow instance failed over"
            );
        }
        Ok(recovered)
    }

    /// Decide the fate of one attempt of a dead master. Returns whether the
    /// row changed.
    async fn recover_task(&self, task: &mut TaskInstance, dead: &str) -> bool {
        if !task.status.is_on_host() {
            return false;
        }
        let host = task.host.clone().unwrap_or_default();
        let on_live_worker =
            !self.logic.is_logic(&task.task_type) && host != dead && self.directory.contains(&host);

        if on_live_worker && task.status == TaskStatus::Running {
            match self.dispatcher.take_over(&host, task.id).await {
                Ok(true) => {
                    info!(task_instance_id = task.id, worker = %host, "Running task taken over");
                    return false;
                }
                Ok(false) => debug!(task_instance_id = task.id, worker = %host, "Worker no longer knows task"),
                Err(e) => warn!(task_instance_id = task.id, worker = %host, error = %e, "Take-over failed"),
            }
        }
        match task.transition_to(TaskStatus::NeedFaultTolerance) {
            Ok(_) => true,
            Err(e) => {
                warn!(task_instance_id = task.id, error = %e, "Cannot mark task for fault tolerance");
                false
            }
        }
    }
}
