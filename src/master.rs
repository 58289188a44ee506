//! The master process: owns the collaborators, routes commands and worker
//! events to runnables, and keeps this node registered.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{InstanceCache, TaskRouteTable, WorkflowHandle};
use crate::core::config::MasterConfig;
use crate::core::errors::{MasterError, Result};
use crate::dag::WorkflowDag;
use crate::dispatch::{DispatchSettings, HostManager, TaskDispatcher, WorkerClient, WorkerDirectory};
use crate::engine::{
    EngineContext, EngineSettings, TaskExecutionEvent, WorkflowCommand, WorkflowEvent, WorkflowExecutionRunnable,
};
use crate::failover::FailoverCoordinator;
use crate::logic::LogicTaskRegistry;
use crate::model::{ParamPool, WorkflowDefinition, WorkflowInstance, WorkflowInstanceId};
use crate::registry::{paths, MasterHeartbeat, Registry};
use crate::storage::{MemoryStorage, Persistence, SledStorage};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Requests entering the master-wide loop
#[derive(Debug)]
pub enum MasterCommand {
    StartWorkflow {
        definition: WorkflowDefinition,
        params: ParamPool,
        reply: oneshot::Sender<Result<WorkflowInstanceId>>,
    },
    /// Report from a worker, routed by task instance id
    TaskEvent(TaskExecutionEvent),
    Control {
        workflow_instance_id: WorkflowInstanceId,
        command: WorkflowCommand,
    },
    /// Rebuild the runnable of an instance from storage
    RecoverWorkflow(WorkflowInstanceId),
}

pub struct MasterServer {
    config: MasterConfig,
    registry: Arc<dyn Registry>,
    engine: EngineContext,
    directory: Arc<WorkerDirectory>,
    cache: Arc<InstanceCache>,
    permits: Arc<Semaphore>,
    commands: mpsc::Sender<MasterCommand>,
    command_rx: Mutex<Option<mpsc::Receiver<MasterCommand>>>,
    shutdown: Arc<Notify>,
    background: Mutex<Vec<JoinHandle<()>>>,
    runnables: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    started_at: DateTime<Utc>,
}

impl MasterServer {
    /// Storage is chosen from the configuration: sled when a path is set,
    /// memory otherwise.
    pub fn open(config: MasterConfig, registry: Arc<dyn Registry>, client: Arc<dyn WorkerClient>) -> Result<Self> {
        let storage: Arc<dyn Persistence> = match &config.storage_path {
            Some(path) => Arc::new(SledStorage::open(path)?),
            None => Arc::new(MemoryStorage::new()),
        };
        Self::new(config, storage, registry, client)
    }

    pub fn new(
        config: MasterConfig,
        storage: Arc<dyn Persistence>,
        registry: Arc<dyn Registry>,
        client: Arc<dyn WorkerClient>,
    ) -> Result<Self> {
        config.validate()?;

        let logic = LogicTaskRegistry::with_defaults()?;
        let directory = Arc::new(WorkerDirectory::new());
        let dispatcher = Arc::new(TaskDispatcher::new(
            DispatchSettings::from_config(&config),
            HostManager::new(directory.clone(), config.host_selector),
            client,
            storage.clone(),
            logic.clone(),
        ));
        let engine = EngineContext {
            storage,
            dispatcher,
            logic,
            routes: Arc::new(TaskRouteTable::new()),
            settings: EngineSettings::from_config(&config),
        };
        let (commands, command_rx) = mpsc::channel(config.command_channel_capacity);

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_active_workflows)),
            config,
            registry,
            engine,
            directory,
            cache: Arc::new(InstanceCache::new()),
            commands,
            command_rx: Mutex::new(Some(command_rx)),
            shutdown: Arc::new(Notify::new()),
            background: Mutex::new(Vec::new()),
            runnables: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            started_at: Utc::now(),
        })
    }

    pub fn config(&self) -> &MasterConfig {
        &self.config
    }

    pub fn host(&self) -> &str {
        &self.config.listen_host
    }

    pub fn storage(&self) -> &Arc<dyn Persistence> {
        &self.engine.storage
    }

    pub fn cache(&self) -> &Arc<InstanceCache> {
        &self.cache
    }

    pub fn directory(&self) -> &Arc<WorkerDirectory> {
        &self.directory
    }

    /// Inbox of the master loop, for RPC front-ends and the failover
    /// coordinator.
    pub fn sender(&self) -> mpsc::Sender<MasterCommand> {
        self.commands.clone()
    }

    pub fn active_workflows(&self) -> usize {
        self.cache.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(MasterError::channel(self.config.listen_host.clone(), "master is shut down"));
        }
        Ok(())
    }

    /// Register this node, sync the worker directory, start the background
    /// loops and pick up instances this address already owns.
    #[instrument(skip(self), fields(master = %self.config.listen_host))]
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let rx = self
            .command_rx
            .lock()
            .take()
            .ok_or_else(|| MasterError::internal("master already started"))?;

        self.publish_heartbeat().await?;
        let workers = self.directory.refresh(self.registry.as_ref()).await?;

        let subscription = self.registry.subscribe(paths::NODES_ROOT).await?;
        let failover = Arc::new(FailoverCoordinator::new(
            self.config.listen_host.clone(),
            self.registry.clone(),
            self.engine.storage.clone(),
            self.directory.clone(),
            self.engine.dispatcher.clone(),
            self.engine.logic.clone(),
            self.cache.clone(),
            self.commands.clone(),
            self.config.failover_lock_timeout,
        ));
        let handles = vec![
            failover.spawn(subscription, self.shutdown.clone()),
            self.spawn_heartbeat(),
            self.spawn_command_loop(rx),
        ];
        self.background.lock().extend(handles);

        let owned = self.engine.storage.workflow_instances_by_host(self.host()).await?;
        for instance in owned.into_iter().filter(|i| !i.status.is_finished()) {
            if let Err(e) = self.recover_workflow(instance.id).await {
                error!(workflow_instance_id = instance.id, error = %e, "Self-recovery failed");
            }
        }
        info!(workers, "Master started");
        Ok(())
    }

    async fn publish_heartbeat(&self) -> Result<()> {
        let heartbeat = MasterHeartbeat {
            host: self.config.listen_host.clone(),
            start_time: self.started_at,
            report_time: Utc::now(),
            active_workflows: self.cache.len(),
        };
        let value = serde_json::to_string(&heartbeat)?;
        self.registry
            .put(&paths::master_path(&self.config.listen_host), &value, true)
            .await
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let server = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(server.config.heartbeat_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        debug!("Heartbeat loop shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = server.publish_heartbeat().await {
                            warn!(error = %e, "Master heartbeat failed");
                        }
                    }
                }
            }
        })
    }

    fn spawn_command_loop(self: &Arc<Self>, mut rx: mpsc::Receiver<MasterCommand>) -> JoinHandle<()> {
        let server = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        tokio::spawn(async move {
            info!("Master command loop started");
            loop {
                tokio::select! {
                    _ = shutdown.notified() => {
                        info!("Master command loop shutting down");
                        break;
                    }
                    command = rx.recv() => match command {
                        Some(command) => server.handle_command(command).await,
                        None => break,
                    },
                }
            }
        })
    }

    pub async fn handle_command(&self, command: MasterCommand) {
        match command {
            MasterCommand::StartWorkflow {
                definition,
                params,
                reply,
            } => {
                let result = self.start_workflow(&definition, params).await;
                if reply.send(result).is_err() {
                    debug!("Start requester went away");
                }
            }
            MasterCommand::TaskEvent(event) => {
                if let Err(e) = self.route_task_event(event).await {
                    warn!(error = %e, category = e.category(), "Task event dropped");
                }
            }
            MasterCommand::Control {
                workflow_instance_id,
                command,
            } => {
                if let Err(e) = self.control(workflow_instance_id, command).await {
                    warn!(workflow_instance_id, ?command, error = %e, "Control command failed");
                }
            }
            MasterCommand::RecoverWorkflow(id) => {
                if let Err(e) = self.recover_workflow(id).await {
                    error!(workflow_instance_id = id, error = %e, category = e.category(), "Recovery failed");
                }
            }
        }
    }

    /// Create an instance of `definition` and start driving it. `params`
    /// override the definition's global parameters.
    #[instrument(skip(self, definition, params), fields(definition_code = definition.code))]
    pub async fn start_workflow(
        &self,
        definition: &WorkflowDefinition,
        params: ParamPool,
    ) -> Result<WorkflowInstanceId> {
        let dag = WorkflowDag::build(definition)?;
        let storage = &self.engine.storage;
        storage.save_definition(definition).await?;

        let id = storage.next_workflow_instance_id().await?;
        let mut instance = WorkflowInstance::new(id, definition);
        instance.global_params.extend(params);
        instance.host = Some(self.config.listen_host.clone());
        storage.save_workflow_instance(&instance).await?;

        self.spawn_runnable(WorkflowExecutionRunnable::new(self.engine.clone(), instance, dag))?;
        info!(workflow_instance_id = id, nodes = definition.tasks.len(), "Workflow instance started");
        Ok(id)
    }

    /// Rebuild and drive an instance from its persisted rows. Returns
    /// `false` when a runnable for it is already cached.
    pub async fn recover_workflow(&self, id: WorkflowInstanceId) -> Result<bool> {
        self.recover_with(id, None).await
    }

    async fn recover_with(&self, id: WorkflowInstanceId, initial: Option<WorkflowEvent>) -> Result<bool> {
        if self.cache.contains(id) {
            debug!(workflow_instance_id = id, "Already cached, recovery skipped");
            return Ok(false);
        }
        let storage = &self.engine.storage;
        let instance = storage
            .get_workflow_instance(id)
            .await?
            .ok_or(MasterError::WorkflowNotFound(id))?;
        if instance.status.is_terminal() {
            debug!(workflow_instance_id = id, status = %instance.status, "Finished instance not recovered");
            return Ok(false);
        }
        let definition = storage
            .get_definition(instance.definition_code, instance.definition_version)
            .await?
            .ok_or_else(|| {
                MasterError::validation(format!(
                    "definition {} v{} of instance {} is missing",
                    instance.definition_code, instance.definition_version, id
                ))
            })?;
        let dag = WorkflowDag::build(&definition)?;
        let tasks = storage.task_instances(id).await?;

        let mut runnable = WorkflowExecutionRunnable::restore(self.engine.clone(), instance, dag, tasks)?;
        if let Some(event) = initial {
            runnable = runnable.with_initial_event(event);
        }
        self.spawn_runnable(runnable)?;
        info!(workflow_instance_id = id, "Workflow instance recovered");
        Ok(true)
    }

    fn spawn_runnable(&self, runnable: WorkflowExecutionRunnable) -> Result<()> {
        self.ensure_open()?;
        let id = runnable.instance().id;
        let (tx, rx) = mpsc::channel(self.config.event_channel_capacity);
        self.cache.insert(WorkflowHandle::new(id, tx))?;
        // shutdown may have cleared the cache between the check and the insert
        if self.is_closed() {
            self.cache.remove(id);
            return self.ensure_open();
        }

        let cache = Arc::clone(&self.cache);
        let routes = Arc::clone(&self.engine.routes);
        let permits = Arc::clone(&self.permits);
        let handle = tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                warn!(workflow_instance_id = id, "Runnable pool closed");
                drop(rx);
                cache.remove_if_closed(id);
                return;
            };
            let finished = runnable.run(rx).await;
            cache.remove_if_closed(id);
            if finished.status.is_terminal() {
                routes.remove_workflow(id);
            }
            debug!(workflow_instance_id = id, status = %finished.status, "Runnable released");
        });
        let mut runnables = self.runnables.lock();
        runnables.retain(|h| !h.is_finished());
        runnables.push(handle);
        Ok(())
    }

    /// Deliver a pause/stop/kill/resume command. Parked instances have no
    /// runnable; they are recovered with the command as their first event.
    pub async fn control(&self, id: WorkflowInstanceId, command: WorkflowCommand) -> Result<()> {
        self.ensure_open()?;
        if let Some(handle) = self.cache.get(id) {
            if handle.deliver(command).is_ok() {
                return Ok(());
            }
            // the runnable exited between lookup and send
            self.cache.remove_if_closed(id);
        }

        let instance = self
            .engine
            .storage
            .get_workflow_instance(id)
            .await?
            .ok_or(MasterError::WorkflowNotFound(id))?;
        if instance.status.is_terminal() {
            debug!(workflow_instance_id = id, ?command, "Command for finished instance ignored");
            return Ok(());
        }
        if instance.host.as_deref() != Some(self.host()) {
            return Err(MasterError::validation(format!(
                "workflow instance {} is owned by {}",
                id,
                instance.host.as_deref().unwrap_or("nobody")
            )));
        }
        match self.recover_with(id, Some(command.into())).await {
            Ok(true) => Ok(()),
            // someone else recovered it first; hand the command over
            Ok(false) | Err(MasterError::DuplicateInstance(_)) => match self.cache.get(id) {
                Some(handle) => handle.deliver(command),
                None => Ok(()),
            },
            Err(e) => Err(e),
        }
    }

    /// Route a worker report to the runnable owning the task.
    pub async fn route_task_event(&self, event: TaskExecutionEvent) -> Result<()> {
        self.ensure_open()?;
        let task_id = event.task_instance_id();
        let workflow_id = match self.engine.routes.lookup(task_id) {
            Some(id) => id,
            None => self
                .engine
                .storage
                .get_task_instance(task_id)
                .await?
                .map(|t| t.workflow_instance_id)
                .ok_or(MasterError::TaskInstanceNotFound(task_id))?,
        };
        match self.cache.get(workflow_id) {
            Some(handle) => handle.deliver(event),
            None => {
                debug!(task_instance_id = task_id, workflow_instance_id = workflow_id, "No live runnable, event dropped");
                Ok(())
            }
        }
    }

    /// Stop background loops and every runnable, then deregister and flush
    /// storage. Instances stay owned by this address in storage; a restart or
    /// a failover of this node picks them up once the runnables are gone.
    pub async fn shutdown(&self) -> Result<()> {
        info!(master = %self.config.listen_host, "Shutting down master");
        self.shutdown.notify_waiters();

        let handles: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(handles)).await.is_err() {
            warn!("Background loops did not stop in time");
        }

        self.closed.store(true, Ordering::SeqCst);
        self.permits.close();
        let released = self.cache.clear();
        let runnables: Vec<JoinHandle<()>> = self.runnables.lock().drain(..).collect();
        let aborts: Vec<_> = runnables.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all(runnables)).await.is_err() {
            warn!("Runnables did not stop in time, aborting");
            aborts.iter().for_each(|h| h.abort());
        }
        info!(released, "Runnables stopped");

        if let Err(e) = self.registry.delete(&paths::master_path(&self.config.listen_host)).await {
            warn!(error = %e, "Failed to deregister master");
        }
        self.engine.storage.flush().await
    }
}
