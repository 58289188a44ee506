use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use super::events::{TaskExecutionEvent, WorkflowCommand, WorkflowEvent};
use super::frontier::Frontier;
use super::retry::{RetryPolicy, RetryStrategy};
use crate::cache::TaskRouteTable;
use crate::core::config::MasterConfig;
use crate::core::errors::{MasterError, Result};
use crate::dag::{BranchOverlay, WorkflowDag};
use crate::dispatch::{DispatchRequest, DispatchTarget, TaskDispatcher};
use crate::logic::{DependencySnapshot, ExternalWorkflowState, LogicResult, LogicStatus, LogicTaskContext, LogicTaskRegistry};
use crate::model::{
    DefinitionCode, FailureStrategy, ParamPool, TaskCode, TaskInstance, TaskInstanceId, TaskStatus, Transition,
    WorkflowInstance, WorkflowStatus,
};
use crate::storage::Persistence;

/// Engine-wide knobs taken from the master configuration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub default_worker_group: String,
    pub default_retry_strategy: RetryStrategy,
    pub tick_interval: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &MasterConfig) -> Self {
        Self {
            default_worker_group: config.default_worker_group.clone(),
            default_retry_strategy: config.default_retry_strategy.clone(),
            tick_interval: config.tick_interval,
        }
    }
}

/// Shared collaborators handed to every runnable
#[derive(Clone)]
pub struct EngineContext {
    pub storage: Arc<dyn Persistence>,
    pub dispatcher: Arc<TaskDispatcher>,
    pub logic: LogicTaskRegistry,
    pub routes: Arc<TaskRouteTable>,
    pub settings: EngineSettings,
}

/// Single driver of one workflow instance.
///
/// Owns the instance, its DAG, the branch overlay and the current attempt of
/// every node. Events are applied one at a time in arrival order; after each
/// one the frontier is recomputed, new attempts are submitted and dispatched,
/// and the instance is finalized once nothing is in flight. Errors never
/// leave the event handler, they are logged and the instance keeps going.
pub struct WorkflowExecutionRunnable {
    ctx: EngineContext,
    instance: WorkflowInstance,
    dag: WorkflowDag,
    overlay: BranchOverlay,
    triggered_blocks: BTreeSet<TaskCode>,
    current: HashMap<TaskCode, TaskInstance>,
    attempt_codes: HashMap<TaskInstanceId, TaskCode>,
    attempts: HashMap<TaskCode, usize>,
    initial_event: Option<WorkflowEvent>,
}

impl WorkflowExecutionRunnable {
    pub fn new(ctx: EngineContext, instance: WorkflowInstance, dag: WorkflowDag) -> Self {
        Self {
            ctx,
            instance,
            dag,
            overlay: BranchOverlay::new(),
            triggered_blocks: BTreeSet::new(),
            current: HashMap::new(),
            attempt_codes: HashMap::new(),
            attempts: HashMap::new(),
            initial_event: None,
        }
    }

    /// Rebuild a runnable from persisted task rows, superseded attempts
    /// included. Branch decisions and blocking verdicts are replayed from
    /// the stored state of finished logic tasks.
    pub fn restore(
        ctx: EngineContext,
        instance: WorkflowInstance,
        dag: WorkflowDag,
        tasks: Vec<TaskInstance>,
    ) -> Result<Self> {
        let mut runnable = Self::new(ctx, instance, dag);
        let mut tasks = tasks;
        tasks.sort_by_key(|t| t.id);
        for task in tasks {
            let code = task.task_code;
            if !runnable.dag.contains_node(code) {
                return Err(MasterError::validation(format!(
                    "task instance {} references node {} missing from workflow {}",
                    task.id, code, runnable.instance.id
                )));
            }
            if task.valid && task.status == TaskStatus::Success {
                if let Some(state) = &task.logic_state {
                    let result = LogicResult::from_state(state)?;
                    runnable.apply_decision(code, &result);
                }
            }
            runnable.ctx.routes.register(task.id, runnable.instance.id);
            runnable.attempt_codes.insert(task.id, code);
            *runnable.attempts.entry(code).or_default() += 1;
            if task.valid {
                runnable.current.insert(code, task);
            }
        }
        debug!(
            workflow_instance_id = runnable.instance.id,
            attempts = runnable.attempt_codes.len(),
            "Runnable restored"
        );
        Ok(runnable)
    }

    /// Event processed right after start, before anything from the inbox.
    pub fn with_initial_event(mut self, event: WorkflowEvent) -> Self {
        self.initial_event = Some(event);
        self
    }

    pub fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub fn dag(&self) -> &WorkflowDag {
        &self.dag
    }

    pub fn overlay(&self) -> &BranchOverlay {
        &self.overlay
    }

    /// Current attempt of a node
    pub fn task_for_code(&self, code: TaskCode) -> Option<&TaskInstance> {
        self.current.get(&code)
    }

    /// Number of attempts created for a node
    pub fn attempts(&self, code: TaskCode) -> usize {
        self.attempts.get(&code).copied().unwrap_or(0)
    }

    pub fn frontier(&self) -> Frontier {
        let statuses: HashMap<TaskCode, TaskStatus> = self.current.iter().map(|(c, t)| (*c, t.status)).collect();
        Frontier::compute(&self.dag, &self.overlay, &statuses, &self.triggered_blocks)
    }

    /// Drive the instance until it finishes or parks, then hand it back.
    pub async fn run(mut self, mut events: mpsc::Receiver<WorkflowEvent>) -> WorkflowInstance {
        self.start().await;

        let mut ticker = tokio::time::interval(self.ctx.settings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        while !self.instance.status.is_finished() {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!(workflow_instance_id = self.instance.id, "Inbox closed, runnable exits");
                        break;
                    }
                },
                _ = ticker.tick() => self.handle_event(WorkflowEvent::Tick).await,
            }
        }
        info!(
            workflow_instance_id = self.instance.id,
            status = %self.instance.status,
            "Workflow runnable exited"
        );
        self.instance
    }

    /// Take ownership: mark the instance running on this master and
    /// resubmit attempts orphaned by a failover.
    #[instrument(skip_all, fields(workflow_instance_id = self.instance.id))]
    pub async fn start(&mut self) {
        if let Err(e) = self.try_start().await {
            error!(error = %e, category = e.category(), "Failed to start workflow");
        }
        match self.initial_event.take() {
            Some(event) => self.handle_event(event).await,
            None => self.advance_logged().await,
        }
    }

    async fn try_start(&mut self) -> Result<()> {
        self.instance.host = Some(self.ctx.dispatcher.master_host().to_string());
        if matches!(
            self.instance.status,
            WorkflowStatus::Submitted | WorkflowStatus::NeedFaultTolerance
        ) {
            self.instance.run_times += 1;
            if self.instance.start_time.is_none() {
                self.instance.start_time = Some(Utc::now());
            }
            self.instance.transition_to(WorkflowStatus::Running)?;
        }
        self.save_instance().await?;
        info!(status = %self.instance.status, run_times = self.instance.run_times, "Workflow started");

        let orphaned: Vec<TaskCode> = self.codes_where(|t| t.status == TaskStatus::NeedFaultTolerance);
        for code in orphaned {
            self.resubmit_after_fault(code).await?;
        }
        Ok(())
    }

    /// Apply one event, then advance. Never fails.
    #[instrument(skip_all, fields(workflow_instance_id = self.instance.id))]
    pub async fn handle_event(&mut self, event: WorkflowEvent) {
        let result = match event {
            WorkflowEvent::Task(event) => self.on_task_event(event).await,
            WorkflowEvent::Command(command) => self.on_command(command).await,
            WorkflowEvent::WorkerLost { host } => self.on_worker_lost(&host).await,
            WorkflowEvent::Tick => self.on_tick().await,
        };
        if let Err(e) = result {
            error!(error = %e, category = e.category(), "Failed to apply workflow event");
        }
        self.advance_logged().await;
    }

    async fn advance_logged(&mut self) {
        if let Err(e) = self.advance().await {
            error!(error = %e, category = e.category(), "Failed to advance workflow");
        }
    }

    // ----- worker events -----

    async fn on_task_event(&mut self, event: TaskExecutionEvent) -> Result<()> {
        let id = event.task_instance_id();
        let Some(&code) = self.attempt_codes.get(&id) else {
            warn!(task_instance_id = id, "Event for unknown task instance ignored");
            return Ok(());
        };
        let Some(task) = self.current.get_mut(&code).filter(|t| t.id == id) else {
            debug!(task_instance_id = id, "Event for superseded attempt ignored");
            return Ok(());
        };
        if task.status.is_terminal() {
            debug!(task_instance_id = id, status = %task.status, "Late event for finished task ignored");
            return Ok(());
        }

        match event {
            TaskExecutionEvent::Running { host, start_time, .. } => {
                if let Err(e) = task.transition_to(TaskStatus::Running) {
                    warn!(task_instance_id = id, error = %e, "Running report ignored");
                    return Ok(());
                }
                task.host = Some(host);
                task.start_time = Some(start_time);
                self.ctx.storage.save_task_instance(task).await?;
                debug!(task_code = code, task_instance_id = id, "Task running");
            }
            TaskExecutionEvent::Finished {
                status,
                end_time,
                var_pool,
                error,
                ..
            } => {
                if !status.is_terminal() {
                    warn!(task_instance_id = id, %status, "Finished report with non-terminal status ignored");
                    return Ok(());
                }
                match task.transition_to(status) {
                    Ok(Transition::Applied) => {}
                    Ok(Transition::Ignored) => return Ok(()),
                    Err(e) => {
                        warn!(task_instance_id = id, error = %e, "Finished report ignored");
                        return Ok(());
                    }
                }
                task.end_time = Some(end_time);
                task.error = error;
                if status == TaskStatus::Success {
                    self.instance.var_pool.extend(var_pool.iter().map(|(k, v)| (k.clone(), v.clone())));
                    task.var_pool = var_pool;
                }
                self.ctx.storage.save_task_instance(task).await?;
                info!(task_code = code, task_instance_id = id, %status, "Task finished");

                match status {
                    TaskStatus::Success => self.save_instance().await?,
                    TaskStatus::Failure => self.on_attempt_failed(code).await?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    async fn on_worker_lost(&mut self, host: &str) -> Result<()> {
        let logic = self.ctx.logic.clone();
        let affected = self.codes_where(|t| {
            t.host.as_deref() == Some(host) && t.status.is_on_host() && !logic.is_logic(&t.task_type)
        });
        for code in affected {
            if let Some(task) = self.current.get_mut(&code) {
                task.transition_to(TaskStatus::NeedFaultTolerance)?;
                self.ctx.storage.save_task_instance(task).await?;
                warn!(task_code = code, task_instance_id = task.id, %host, "Worker lost, task needs fault tolerance");
            }
            self.resubmit_after_fault(code).await?;
        }
        Ok(())
    }

    /// Move a NEED_FAULT_TOLERANCE attempt back into play. The retry budget
    /// is untouched.
    async fn resubmit_after_fault(&mut self, code: TaskCode) -> Result<()> {
        let status = self.instance.status;
        let Some(task) = self.current.get_mut(&code) else {
            return Ok(());
        };
        match status {
            WorkflowStatus::ReadyStop | WorkflowStatus::Stop => {
                task.transition_to(TaskStatus::Kill)?;
            }
            WorkflowStatus::ReadyPause | WorkflowStatus::Pause => {
                task.transition_to(TaskStatus::Submitted)?;
                task.transition_to(TaskStatus::Pause)?;
            }
            _ => {
                task.transition_to(TaskStatus::Submitted)?;
            }
        }
        task.host = None;
        task.delay_until = None;
        self.ctx.storage.save_task_instance(task).await?;
        debug!(task_code = code, status = %task.status, "Fault-tolerant attempt resubmitted");
        Ok(())
    }

    async fn on_tick(&mut self) -> Result<()> {
        if !self.may_dispatch() {
            return Ok(());
        }
        let logic = self.ctx.logic.clone();
        let waiting = self.codes_where(|t| t.status.is_on_host() && logic.is_logic(&t.task_type));
        for code in waiting {
            self.execute_logic(code).await?;
        }
        Ok(())
    }

    // ----- commands -----

    async fn on_command(&mut self, command: WorkflowCommand) -> Result<()> {
        info!(?command, status = %self.instance.status, "Workflow command received");
        match command {
            WorkflowCommand::Pause => self.pause().await,
            WorkflowCommand::Stop => self.stop().await,
            WorkflowCommand::Kill => self.kill().await,
            WorkflowCommand::Resume => self.resume().await,
        }
    }

    async fn pause(&mut self) -> Result<()> {
        if !matches!(self.instance.status, WorkflowStatus::Running | WorkflowStatus::ReadyBlock) {
            debug!(status = %self.instance.status, "Pause ignored");
            return Ok(());
        }
        self.instance.transition_to(WorkflowStatus::ReadyPause)?;

        let logic = self.ctx.logic.clone();
        let pausable = self.codes_where(|t| {
            matches!(t.status, TaskStatus::Submitted | TaskStatus::NeedFaultTolerance)
                || (logic.is_logic(&t.task_type) && t.status.is_on_host())
        });
        for code in pausable {
            if let Some(task) = self.current.get_mut(&code) {
                if task.status == TaskStatus::NeedFaultTolerance {
                    task.transition_to(TaskStatus::Submitted)?;
                    task.host = None;
                }
                task.transition_to(TaskStatus::Pause)?;
                self.ctx.storage.save_task_instance(task).await?;
            }
        }
        self.save_instance().await
    }

    async fn stop(&mut self) -> Result<()> {
        match self.instance.status {
            s if s.is_terminal() || s == WorkflowStatus::ReadyStop => {
                debug!(status = %s, "Stop ignored");
                return Ok(());
            }
            WorkflowStatus::Pause | WorkflowStatus::Block => {
                self.kill_local(|_| true).await?;
                self.instance.transition_to(WorkflowStatus::Stop)?;
                return self.save_instance().await;
            }
            _ => {}
        }
        self.instance.transition_to(WorkflowStatus::ReadyStop)?;

        let logic = self.ctx.logic.clone();
        let remote = self.codes_where(|t| t.status.is_on_host() && !logic.is_logic(&t.task_type));
        for code in remote {
            let Some((host, id)) = self.current.get(&code).and_then(|t| Some((t.host.clone()?, t.id))) else {
                self.mark_killed(code).await?;
                continue;
            };
            if let Err(e) = self.ctx.dispatcher.kill(&host, id).await {
                warn!(task_code = code, %host, error = %e, "Kill request failed, killing locally");
                self.mark_killed(code).await?;
            }
        }
        let remote_ok = |t: &TaskInstance| !t.status.is_on_host() || logic.is_logic(&t.task_type);
        self.kill_local(remote_ok).await?;
        self.save_instance().await
    }

    async fn kill(&mut self) -> Result<()> {
        if self.instance.status.is_terminal() {
            debug!("Kill ignored");
            return Ok(());
        }
        let logic = self.ctx.logic.clone();
        let remote = self.codes_where(|t| t.status.is_on_host() && !logic.is_logic(&t.task_type));
        for code in remote {
            let Some((host, id)) = self.current.get(&code).and_then(|t| Some((t.host.clone()?, t.id))) else {
                continue;
            };
            if let Err(e) = self.ctx.dispatcher.kill(&host, id).await {
                warn!(task_code = code, %host, error = %e, "Kill request failed");
            }
        }
        self.kill_local(|_| true).await?;
        self.instance.transition_to(WorkflowStatus::Stop)?;
        self.save_instance().await
    }

    async fn resume(&mut self) -> Result<()> {
        if !matches!(
            self.instance.status,
            WorkflowStatus::Pause | WorkflowStatus::Block | WorkflowStatus::ReadyPause | WorkflowStatus::ReadyBlock
        ) {
            debug!(status = %self.instance.status, "Resume ignored");
            return Ok(());
        }

        for code in std::mem::take(&mut self.triggered_blocks) {
            if let Some(task) = self.current.get_mut(&code) {
                let mut verdict = match &task.logic_state {
                    Some(state) => LogicResult::from_state(state)?,
                    None => continue,
                };
                verdict.block = false;
                task.logic_state = Some(verdict.to_state()?);
                self.ctx.storage.save_task_instance(task).await?;
            }
        }
        self.instance.blocked = false;

        let paused = self.codes_where(|t| t.status == TaskStatus::Pause);
        for code in paused {
            if let Some(task) = self.current.get_mut(&code) {
                task.transition_to(TaskStatus::Submitted)?;
                task.delay_until = None;
                self.ctx.storage.save_task_instance(task).await?;
            }
        }
        self.instance.transition_to(WorkflowStatus::Running)?;
        info!("Workflow resumed");
        self.save_instance().await
    }

    async fn kill_local(&mut self, include: impl Fn(&TaskInstance) -> bool) -> Result<()> {
        let codes = self.codes_where(|t| !t.status.is_terminal() && include(t));
        for code in codes {
            self.mark_killed(code).await?;
        }
        Ok(())
    }

    async fn mark_killed(&mut self, code: TaskCode) -> Result<()> {
        if let Some(task) = self.current.get_mut(&code) {
            if task.transition_to(TaskStatus::Kill)? == Transition::Applied {
                self.ctx.storage.save_task_instance(task).await?;
                debug!(task_code = code, task_instance_id = task.id, "Task killed");
            }
        }
        Ok(())
    }

    // ----- progress -----

    fn may_dispatch(&self) -> bool {
        matches!(self.instance.status, WorkflowStatus::Running | WorkflowStatus::ReadyBlock)
    }

    fn may_submit(&self, frontier: &Frontier) -> bool {
        self.may_dispatch() && !(self.instance.failure_strategy == FailureStrategy::End && frontier.has_failure())
    }

    /// Dispatch ready attempts and submit newly runnable nodes until nothing
    /// changes, then try to finalize.
    async fn advance(&mut self) -> Result<()> {
        loop {
            if self.instance.status.is_finished() {
                return Ok(());
            }
            let mut progressed = if self.may_dispatch() {
                self.dispatch_ready().await?
            } else {
                false
            };

            let frontier = self.frontier();
            if self.may_submit(&frontier) && !frontier.runnable.is_empty() {
                for &code in &frontier.runnable {
                    self.submit(code).await?;
                }
                progressed = true;
            }
            if !progressed {
                return self.try_finalize(&frontier).await;
            }
        }
    }

    async fn submit(&mut self, code: TaskCode) -> Result<()> {
        let definition = &self.dag.node(code)?.definition;
        let worker_group = definition
            .worker_group
            .clone()
            .unwrap_or_else(|| self.ctx.settings.default_worker_group.clone());
        let id = self.ctx.storage.next_task_instance_id().await?;
        let task = TaskInstance::new(id, self.instance.id, definition, worker_group);
        self.ctx.storage.save_task_instance(&task).await?;
        debug!(task_code = code, task_instance_id = id, "Task submitted");
        self.track(task);
        Ok(())
    }

    fn track(&mut self, task: TaskInstance) {
        self.ctx.routes.register(task.id, self.instance.id);
        self.attempt_codes.insert(task.id, task.task_code);
        *self.attempts.entry(task.task_code).or_default() += 1;
        self.current.insert(task.task_code, task);
    }

    async fn dispatch_ready(&mut self) -> Result<bool> {
        let now = Utc::now();
        let ready = self.codes_where(|t| t.is_ready_to_dispatch(now));
        let progressed = !ready.is_empty();
        for code in ready {
            self.dispatch(code).await?;
        }
        Ok(progressed)
    }

    async fn dispatch(&mut self, code: TaskCode) -> Result<()> {
        let request = self.build_request(code)?;
        let Some(task) = self.current.get_mut(&code) else {
            return Ok(());
        };
        let outcome = self.ctx.dispatcher.dispatch(task, &request, &[]).await;
        match outcome {
            Ok(DispatchTarget::Master) => self.execute_logic(code).await,
            Ok(DispatchTarget::Worker(host)) => {
                debug!(task_code = code, host = %host.address, "Task handed to worker");
                Ok(())
            }
            Err(e) => {
                warn!(task_code = code, error = %e, category = e.category(), "Dispatch failed");
                if let Some(task) = self.current.get_mut(&code) {
                    task.transition_to(TaskStatus::Failure)?;
                    task.error = Some(e.to_string());
                    self.ctx.storage.save_task_instance(task).await?;
                }
                if e.is_retryable() {
                    self.on_attempt_failed(code).await?;
                }
                Ok(())
            }
        }
    }

    fn build_request(&self, code: TaskCode) -> Result<DispatchRequest> {
        let task = self
            .current
            .get(&code)
            .ok_or_else(|| MasterError::internal(format!("node {} has no attempt", code)))?;
        let definition = &self.dag.node(code)?.definition;
        let pool = self.upstream_pool(code);
        Ok(DispatchRequest {
            workflow_instance_id: self.instance.id,
            task_instance_id: task.id,
            task_code: code,
            task_name: task.name.clone(),
            task_type: task.task_type.clone(),
            params: self.ctx.logic.expressions().substitute_value(&definition.params, &pool),
            worker_group: task.worker_group.clone(),
            retry_count: task.retry_count,
            master_host: self.ctx.dispatcher.master_host().to_string(),
            timeout_secs: definition.timeout_secs,
            var_pool: pool,
        })
    }

    /// Workflow globals overlaid with the variables of every successful
    /// ancestor, merged in topological order.
    fn upstream_pool(&self, code: TaskCode) -> ParamPool {
        let mut pool = self.instance.global_params.clone();
        let ancestors = self.dag.ancestors(code);
        for ancestor in self.dag.topological_order().iter().filter(|c| ancestors.contains(c)) {
            if let Some(task) = self.current.get(ancestor).filter(|t| t.status == TaskStatus::Success) {
                pool.extend(task.var_pool.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        pool
    }

    /// Schedule the next attempt of a failed node when its budget allows.
    async fn on_attempt_failed(&mut self, code: TaskCode) -> Result<()> {
        let Some(task) = self.current.get(&code) else {
            return Ok(());
        };
        if !matches!(
            self.instance.status,
            WorkflowStatus::Running | WorkflowStatus::ReadyBlock | WorkflowStatus::ReadyPause
        ) {
            return Ok(());
        }
        let definition = &self.dag.node(code)?.definition;
        let policy = RetryPolicy::for_task(definition, &self.ctx.settings.default_retry_strategy);
        if !policy.can_retry(task.retry_count) {
            warn!(task_code = code, attempts = task.retry_count + 1, "Task failed, no retries left");
            return Ok(());
        }

        let next_retry = task.retry_count + 1;
        let delay = policy.delay_for(next_retry);
        let delay_until = if delay.is_zero() {
            None
        } else {
            chrono::Duration::from_std(delay).ok().map(|d| Utc::now() + d)
        };
        let id = self.ctx.storage.next_task_instance_id().await?;
        let mut retry = task.next_attempt(id, delay_until);
        let mut superseded = task.clone();
        superseded.valid = false;
        self.ctx.storage.save_task_instance(&superseded).await?;

        if self.instance.status == WorkflowStatus::ReadyPause {
            retry.transition_to(TaskStatus::Pause)?;
        }
        self.ctx.storage.save_task_instance(&retry).await?;
        info!(
            task_code = code,
            task_instance_id = id,
            retry = next_retry,
            delay_ms = delay.as_millis() as u64,
            "Task scheduled for retry"
        );
        self.track(retry);
        Ok(())
    }

    // ----- logic tasks -----

    async fn execute_logic(&mut self, code: TaskCode) -> Result<()> {
        if let Some(task) = self.current.get_mut(&code) {
            if task.status == TaskStatus::Dispatch {
                task.transition_to(TaskStatus::Running)?;
                self.ctx.storage.save_task_instance(task).await?;
            }
        }
        if self.current.get(&code).map(|t| t.status) != Some(TaskStatus::Running) {
            return Ok(());
        }

        let snapshot = self.dependency_snapshot(code).await?;
        let pool = self.upstream_pool(code);
        let outcome = match (self.dag.node(code), self.current.get(&code)) {
            (Ok(node), Some(task)) => self.ctx.logic.execute(&LogicTaskContext {
                definition: &node.definition,
                task,
                dag: &self.dag,
                params: &pool,
                snapshot: &snapshot,
                expressions: self.ctx.logic.expressions(),
            }),
            _ => return Ok(()),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!(task_code = code, error = %e, "Logic task misconfigured");
                if let Some(task) = self.current.get_mut(&code) {
                    task.transition_to(TaskStatus::Failure)?;
                    task.error = Some(e.to_string());
                    self.ctx.storage.save_task_instance(task).await?;
                }
                return Ok(());
            }
        };

        match result.status {
            LogicStatus::Waiting => {
                debug!(task_code = code, "Logic task waiting on dependencies");
                Ok(())
            }
            LogicStatus::Success => {
                self.apply_decision(code, &result);
                if result.block {
                    self.instance.blocked = true;
                    if self.instance.status == WorkflowStatus::Running {
                        self.instance.transition_to(WorkflowStatus::ReadyBlock)?;
                    }
                    self.save_instance().await?;
                    info!(task_code = code, "Blocking task triggered, workflow blocked");
                }
                if let Some(task) = self.current.get_mut(&code) {
                    task.logic_state = Some(result.to_state()?);
                    task.transition_to(TaskStatus::Success)?;
                    self.ctx.storage.save_task_instance(task).await?;
                }
                debug!(task_code = code, selected = ?result.selected, message = ?result.message, "Logic task succeeded");
                Ok(())
            }
            LogicStatus::Failure => {
                if let Some(task) = self.current.get_mut(&code) {
                    task.logic_state = Some(result.to_state()?);
                    task.error = result.message.clone();
                    task.transition_to(TaskStatus::Failure)?;
                    self.ctx.storage.save_task_instance(task).await?;
                }
                info!(task_code = code, message = ?result.message, "Logic task failed");
                self.on_attempt_failed(code).await
            }
        }
    }

    fn apply_decision(&mut self, code: TaskCode, result: &LogicResult) {
        if let Some(selected) = &result.selected {
            self.overlay.select(code, selected.iter().copied());
        }
        if result.block {
            self.triggered_blocks.insert(code);
        }
    }

    async fn dependency_snapshot(&self, code: TaskCode) -> Result<DependencySnapshot> {
        let definition = &self.dag.node(code)?.definition;
        let trees = self.ctx.logic.dependencies(definition)?;
        let external: BTreeSet<DefinitionCode> = trees.iter().flat_map(|t| t.external_definitions()).collect();

        let mut snapshot = DependencySnapshot {
            local: self.current.iter().map(|(c, t)| (*c, t.status)).collect(),
            unreachable: self.frontier().unreachable().collect(),
            external: HashMap::new(),
        };
        for definition_code in external {
            if let Some(run) = self.ctx.storage.latest_workflow_instance(definition_code).await? {
                let tasks = self
                    .ctx
                    .storage
                    .valid_task_instances(run.id)
                    .await?
                    .into_iter()
                    .map(|t| (t.task_code, t.status))
                    .collect();
                snapshot.external.insert(
                    definition_code,
                    ExternalWorkflowState {
                        status: run.status,
                        tasks,
                    },
                );
            }
        }
        Ok(snapshot)
    }

    // ----- finalization -----

    async fn try_finalize(&mut self, frontier: &Frontier) -> Result<()> {
        if frontier.in_flight > 0 {
            return Ok(());
        }
        let next = match self.instance.status {
            WorkflowStatus::ReadyStop => WorkflowStatus::Stop,
            WorkflowStatus::ReadyPause => {
                let unfinished = !frontier.runnable.is_empty()
                    || !frontier.waiting.is_empty()
                    || !frontier.paused.is_empty()
                    || !frontier.gated.is_empty();
                if unfinished {
                    WorkflowStatus::Pause
                } else {
                    self.settled_outcome(frontier)
                }
            }
            WorkflowStatus::Running | WorkflowStatus::ReadyBlock => {
                if !frontier.gated.is_empty() {
                    if self.instance.status == WorkflowStatus::Running {
                        self.instance.transition_to(WorkflowStatus::ReadyBlock)?;
                    }
                    WorkflowStatus::Block
                } else {
                    self.settled_outcome(frontier)
                }
            }
            _ => return Ok(()),
        };

        self.instance.transition_to(next)?;
        self.save_instance().await?;
        info!(status = %next, "Workflow reached {}", if next.is_terminal() { "terminal state" } else { "parked state" });
        Ok(())
    }

    fn settled_outcome(&self, frontier: &Frontier) -> WorkflowStatus {
        if frontier.has_failure() {
            return WorkflowStatus::Failure;
        }
        if !frontier.waiting.is_empty() || !frontier.paused.is_empty() || !frontier.runnable.is_empty() {
            warn!(
                waiting = ?frontier.waiting,
                paused = ?frontier.paused,
                "Workflow stalled with nothing in flight"
            );
            return WorkflowStatus::Failure;
        }
        WorkflowStatus::Success
    }

    // ----- helpers -----

    /// Codes of current attempts matching `filter`, in topological order.
    fn codes_where(&self, filter: impl Fn(&TaskInstance) -> bool) -> Vec<TaskCode> {
        self.dag
            .topological_order()
            .iter()
            .copied()
            .filter(|c| self.current.get(c).map_or(false, &filter))
            .collect()
    }

    async fn save_instance(&mut self) -> Result<()> {
        self.instance.updated_at = Utc::now();
        self.ctx.storage.save_workflow_instance(&self.instance).await
    }
}
