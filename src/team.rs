//! Team - the unit of orchestration
//!
//! A team bundles agents, tasks, and the shared store, and drives the
//! workflow lifecycle: start, pause, resume, stop, human feedback, and
//! external validation. Task status transitions flow from the store's
//! subscription into a single engine loop, which asks the strategy what
//! to dispatch next and settles the workflow when nothing can move
//! without external input.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::domain::{Agent, Task, TaskStatus, WorkflowLog, WorkflowStatus};
use crate::error::WorkflowError;
use crate::executor::AgentExecutor;
use crate::executor::prompts::interpolate_inputs;
use crate::queue::ExecutionQueue;
use crate::store::{Subscription, TeamState, TeamStore, WorkflowStats};
use crate::strategy::{DeterministicStrategy, ExecutionStrategy, ManagerStrategy, StrategyContext};

/// Signals feeding the engine dispatch loop
enum EngineSignal {
    /// Task statuses changed; ids carried for the strategy
    Changed(Vec<String>),
    /// Workflow resumed; rebuild work for paused tasks
    Resumed,
    /// Tear the loop down
    Shutdown,
}

/// Outcome snapshot returned when the workflow settles
#[derive(Debug)]
pub struct WorkflowCompletion {
    pub status: WorkflowStatus,
    pub result: Option<Value>,
    pub stats: WorkflowStats,
}

struct Runtime {
    queue: Arc<ExecutionQueue>,
    engine_tx: mpsc::UnboundedSender<EngineSignal>,
    engine_handle: JoinHandle<()>,
    subscription: Option<Subscription>,
}

struct TeamInner {
    store: TeamStore,
    manager: Option<Agent>,
    runtime: Mutex<Option<Runtime>>,
}

impl Drop for TeamInner {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.runtime.lock()
            && let Some(runtime) = guard.take()
        {
            runtime.queue.close();
            let _ = runtime.engine_tx.send(EngineSignal::Shutdown);
            if let Some(subscription) = runtime.subscription {
                subscription.unsubscribe();
            }
            runtime.engine_handle.abort();
        }
    }
}

/// Builder for assembling a team before the first run
pub struct TeamBuilder {
    name: String,
    agents: Vec<Agent>,
    tasks: Vec<Task>,
    inputs: BTreeMap<String, Value>,
    env: BTreeMap<String, String>,
    max_concurrency: Option<usize>,
    manager: Option<Agent>,
}

impl TeamBuilder {
    pub fn agents(mut self, agents: impl IntoIterator<Item = Agent>) -> Self {
        self.agents.extend(agents);
        self
    }

    pub fn tasks(mut self, tasks: impl IntoIterator<Item = Task>) -> Self {
        self.tasks.extend(tasks);
        self
    }

    pub fn inputs(mut self, inputs: BTreeMap<String, Value>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    /// Delegate task selection to a supervisor agent instead of the
    /// deterministic scheduler
    pub fn manager(mut self, manager: Agent) -> Self {
        self.manager = Some(manager);
        self
    }

    pub fn build(self) -> Result<Team, WorkflowError> {
        let store = TeamStore::new(self.name);
        store.add_agents(self.agents)?;
        store.add_tasks(self.tasks)?;
        if !self.inputs.is_empty() {
            store.merge_inputs(self.inputs);
        }
        if !self.env.is_empty() {
            store.set_env(self.env);
        }
        if let Some(max_concurrency) = self.max_concurrency {
            store.set_max_concurrency(max_concurrency);
        }

        Ok(Team {
            inner: Arc::new(TeamInner {
                store,
                manager: self.manager,
                runtime: Mutex::new(None),
            }),
        })
    }
}

/// A bundle of agents and tasks driven through a shared reactive store
#[derive(Clone)]
pub struct Team {
    inner: Arc<TeamInner>,
}

impl Team {
    pub fn builder(name: impl Into<String>) -> TeamBuilder {
        TeamBuilder {
            name: name.into(),
            agents: Vec::new(),
            tasks: Vec::new(),
            inputs: BTreeMap::new(),
            env: BTreeMap::new(),
            max_concurrency: None,
            manager: None,
        }
    }

    /// Handle to the underlying store (cheap clone)
    pub fn store(&self) -> TeamStore {
        self.inner.store.clone()
    }

    /// Start the workflow: reset state, pick a strategy, dispatch the
    /// initial tasks, and return once dispatch is underway
    pub async fn start(&self, inputs: Option<BTreeMap<String, Value>>) -> Result<(), WorkflowError> {
        let store = self.inner.store.clone();

        if matches!(
            store.workflow_status(),
            WorkflowStatus::Running | WorkflowStatus::Paused | WorkflowStatus::Stopping
        ) {
            return Err(WorkflowError::AlreadyRunning);
        }

        // A previous settled run may still have its engine alive
        self.teardown_runtime().await;

        store.begin_run(inputs)?;
        info!(team = %store.state().name, "workflow starting");

        let state = store.state();
        let interpolated: Vec<(String, String)> = state
            .tasks
            .iter()
            .map(|t| (t.id.clone(), interpolate_inputs(&t.description, &state.inputs)))
            .collect();
        store.cache_interpolated_descriptions(interpolated);

        let strategy: Arc<dyn ExecutionStrategy> = match &self.inner.manager {
            Some(manager) => Arc::new(ManagerStrategy::new(manager.clone())),
            None => Arc::new(DeterministicStrategy::for_tasks(&state.tasks)),
        };

        let executor = Arc::new(AgentExecutor::new(store.clone()));
        let queue = Arc::new(ExecutionQueue::start(strategy.concurrency(&store.state()), executor));
        let ctx = StrategyContext {
            store: store.clone(),
            queue: Arc::clone(&queue),
        };

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let changed_tx = engine_tx.clone();
        let subscription = store.subscribe(
            |state: &TeamState| {
                state
                    .tasks
                    .iter()
                    .map(|t| (t.id.clone(), t.status))
                    .collect::<Vec<(String, TaskStatus)>>()
            },
            move |next, prev, _state| {
                let changed: Vec<String> = next
                    .iter()
                    .filter(|(id, status)| {
                        prev.and_then(|p| p.iter().find(|(pid, _)| pid == id))
                            .map(|(_, prev_status)| prev_status != status)
                            .unwrap_or(true)
                    })
                    .map(|(id, _)| id.clone())
                    .collect();
                if !changed.is_empty() {
                    let _ = changed_tx.send(EngineSignal::Changed(changed));
                }
            },
        );

        let engine_handle = tokio::spawn(engine_loop(
            store.clone(),
            Arc::clone(&strategy),
            Arc::clone(&queue),
            engine_rx,
        ));

        {
            let mut runtime = self.inner.runtime.lock().expect("runtime lock");
            *runtime = Some(Runtime {
                queue,
                engine_tx,
                engine_handle,
                subscription: Some(subscription),
            });
        }

        if let Err(error) = strategy.start_execution(&ctx).await {
            error!(error = %error, "workflow failed to start");
            store.set_workflow_status(WorkflowStatus::Errored, format!("Workflow errored: {}", error));
            self.teardown_runtime().await;
            return Err(error);
        }

        // A team whose strategy found nothing to dispatch (no tasks, or a
        // supervisor answering DONE immediately) must still settle
        evaluate_settlement(&store);
        Ok(())
    }

    /// Pause dispatch; in-flight iterations checkpoint at their next
    /// boundary
    pub fn pause(&self) -> Result<(), WorkflowError> {
        let store = &self.inner.store;
        if store.workflow_status() != WorkflowStatus::Running {
            return Err(WorkflowError::InvalidState(format!(
                "cannot pause workflow in status {}",
                store.workflow_status()
            )));
        }
        if let Some(runtime) = self.inner.runtime.lock().expect("runtime lock").as_ref() {
            runtime.queue.pause();
        }
        store.set_workflow_status(WorkflowStatus::Paused, "Workflow paused");
        Ok(())
    }

    /// Resume a paused workflow; paused tasks re-enter their loops from
    /// the checkpointed history
    pub fn resume(&self) -> Result<(), WorkflowError> {
        let store = &self.inner.store;
        if store.workflow_status() != WorkflowStatus::Paused {
            return Err(WorkflowError::InvalidState(format!(
                "cannot resume workflow in status {}",
                store.workflow_status()
            )));
        }
        store.set_workflow_status(WorkflowStatus::Running, "Workflow resumed");
        if let Some(runtime) = self.inner.runtime.lock().expect("runtime lock").as_ref() {
            runtime.queue.resume();
            let _ = runtime.engine_tx.send(EngineSignal::Resumed);
        }
        Ok(())
    }

    /// Stop the workflow: cease dispatch, drain in-flight work, abort
    /// whatever was left running, and settle in STOPPED
    pub async fn stop(&self) -> Result<(), WorkflowError> {
        let store = self.inner.store.clone();
        match store.workflow_status() {
            WorkflowStatus::Running | WorkflowStatus::Paused | WorkflowStatus::Blocked | WorkflowStatus::Finished => {}
            other => {
                return Err(WorkflowError::InvalidState(format!(
                    "cannot stop workflow in status {}",
                    other
                )));
            }
        }

        store.set_workflow_status(WorkflowStatus::Stopping, "Workflow stopping");
        self.teardown_runtime().await;

        let state = store.state();
        let leftovers: Vec<String> = state
            .tasks
            .iter()
            .filter(|t| matches!(t.status, TaskStatus::Doing | TaskStatus::Paused | TaskStatus::Resumed))
            .map(|t| t.id.clone())
            .collect();
        if !leftovers.is_empty() {
            store.update_status_of_multiple_tasks(&leftovers, TaskStatus::Aborted)?;
        }

        store.set_workflow_status(WorkflowStatus::Stopped, "Workflow stopped");
        Ok(())
    }

    /// Attach human feedback to a task, forcing it back through REVISE
    pub fn provide_feedback(&self, task_id: &str, content: impl Into<String>) -> Result<(), WorkflowError> {
        self.inner.store.provide_feedback(task_id, content)
    }

    /// Approve a task awaiting external validation
    pub fn validate_task(&self, task_id: &str) -> Result<(), WorkflowError> {
        self.inner.store.validate_task(task_id)
    }

    pub fn workflow_status(&self) -> WorkflowStatus {
        self.inner.store.workflow_status()
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.inner.store.task(task_id).map(|t| t.status)
    }

    pub fn workflow_logs(&self) -> Vec<WorkflowLog> {
        self.inner.store.logs()
    }

    pub fn get_cleaned_state(&self) -> Value {
        self.inner.store.get_cleaned_state()
    }

    pub fn get_workflow_stats(&self) -> WorkflowStats {
        self.inner.store.get_workflow_stats()
    }

    /// Wait until the workflow reaches a settled status (FINISHED,
    /// ERRORED, STOPPED, or BLOCKED) and return the outcome
    pub async fn wait_until_settled(&self) -> WorkflowCompletion {
        let mut status_rx = self.inner.store.status_watch();
        loop {
            let status = *status_rx.borrow_and_update();
            if status.is_settled() {
                break;
            }
            if status_rx.changed().await.is_err() {
                break;
            }
        }

        let state = self.inner.store.state();
        WorkflowCompletion {
            status: state.workflow_status,
            result: state.workflow_result.clone(),
            stats: self.inner.store.get_workflow_stats(),
        }
    }

    /// Wait (by polling) until a task reaches the given status
    pub async fn wait_for_task_status(&self, task_id: &str, status: TaskStatus) -> Result<(), WorkflowError> {
        if self.inner.store.task(task_id).is_none() {
            return Err(WorkflowError::UnknownTask(task_id.to_string()));
        }
        loop {
            if self.task_status(task_id) == Some(status) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn teardown_runtime(&self) {
        let runtime = self.inner.runtime.lock().expect("runtime lock").take();
        if let Some(runtime) = runtime {
            runtime.queue.close();
            runtime.queue.drain().await;
            let _ = runtime.engine_tx.send(EngineSignal::Shutdown);
            if let Some(subscription) = runtime.subscription {
                subscription.unsubscribe();
            }
            let _ = runtime.engine_handle.await;
        }
    }
}

/// The engine loop: one consumer for all dispatch signals
///
/// Serializing dispatch here means strategies never race each other, and
/// settlement is evaluated on a consistent snapshot after every batch.
async fn engine_loop(
    store: TeamStore,
    strategy: Arc<dyn ExecutionStrategy>,
    queue: Arc<ExecutionQueue>,
    mut engine_rx: mpsc::UnboundedReceiver<EngineSignal>,
) {
    let ctx = StrategyContext {
        store: store.clone(),
        queue,
    };

    while let Some(signal) = engine_rx.recv().await {
        match signal {
            EngineSignal::Shutdown => break,
            EngineSignal::Resumed => {
                if let Err(error) = strategy.resume_execution(&ctx).await {
                    fail_workflow(&store, &error);
                    break;
                }
                evaluate_settlement(&store);
            }
            EngineSignal::Changed(changed) => {
                match store.workflow_status() {
                    WorkflowStatus::Running => {}
                    WorkflowStatus::Blocked | WorkflowStatus::Finished => {
                        // Feedback or validation arriving after settlement
                        // re-opens the run
                        if !wake_worthy(&store, &changed) {
                            continue;
                        }
                        store.set_workflow_status(WorkflowStatus::Running, "Workflow resumed by external input");
                    }
                    _ => continue,
                }

                if let Err(error) = strategy.execute_from_changed_tasks(&ctx, &changed).await {
                    fail_workflow(&store, &error);
                    break;
                }
                evaluate_settlement(&store);
                if store.workflow_status().is_terminal() {
                    break;
                }
            }
        }
    }
    debug!("engine loop exited");
}

/// Does this change batch justify waking a settled workflow?
fn wake_worthy(store: &TeamStore, changed: &[String]) -> bool {
    changed.iter().any(|id| {
        store
            .task(id)
            .map(|t| matches!(t.status, TaskStatus::Revise | TaskStatus::Validated | TaskStatus::Todo))
            .unwrap_or(false)
    })
}

fn fail_workflow(store: &TeamStore, error: &WorkflowError) {
    error!(error = %error, "workflow failed");
    store.set_workflow_status(WorkflowStatus::Errored, format!("Workflow errored: {}", error));
}

/// Decide whether the workflow has settled after a dispatch batch
///
/// FINISHED requires every task terminal with at least one completed
/// deliverable; BLOCKED means nothing is running and the strategy found
/// nothing to dispatch, so only external input (feedback, validation)
/// can move the workflow again.
fn evaluate_settlement(store: &TeamStore) {
    let state = store.state();
    if state.workflow_status != WorkflowStatus::Running {
        return;
    }

    if state.all_tasks_terminal() {
        if state.tasks.iter().any(|t| t.is_deliverable && t.status.is_completed()) {
            let result = workflow_result(&state);
            store.set_workflow_result(result);
            store.set_workflow_status(WorkflowStatus::Finished, "Workflow finished");
        } else {
            store.set_workflow_status(WorkflowStatus::Blocked, "Workflow blocked: no deliverable produced");
        }
        return;
    }

    let any_active = state
        .tasks
        .iter()
        .any(|t| matches!(t.status, TaskStatus::Doing | TaskStatus::Paused | TaskStatus::Resumed));
    if !any_active {
        store.set_workflow_status(WorkflowStatus::Blocked, "Workflow blocked: no runnable tasks");
    }
}

/// The workflow result: the last completed deliverable, or failing that
/// the last completed task
fn workflow_result(state: &TeamState) -> Option<Value> {
    state
        .tasks
        .iter()
        .rev()
        .find(|t| t.is_deliverable && t.status.is_completed() && t.result.is_some())
        .or_else(|| {
            state
                .tasks
                .iter()
                .rev()
                .find(|t| t.status.is_completed() && t.result.is_some())
        })
        .and_then(|t| t.result.clone())
}
