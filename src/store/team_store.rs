//! TeamStore - the reactive state container
//!
//! Single source of truth for all workflow state. Mutations go through
//! atomic mutators that commit under a lock, then notify selector-scoped
//! subscribers with the post-commit snapshot. Re-entrant mutations from
//! inside reactions are queued and processed in commit order, so every
//! subscriber observes every committed snapshot exactly once.

use std::collections::{BTreeMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::domain::{
    Agent, AgentStatus, Feedback, Task, TaskStatus, WorkflowLog, WorkflowStatus,
};
use crate::error::WorkflowError;
use crate::llm::ChatMessage;

use super::snapshot::cleaned_state;
use super::stats::{WorkflowStats, compute_workflow_stats};

/// Default ceiling on concurrently executing tasks
pub const DEFAULT_MAX_CONCURRENCY: usize = 5;

/// The full state held by a team store
#[derive(Debug, Clone, Serialize)]
pub struct TeamState {
    pub name: String,
    pub agents: Vec<Agent>,
    pub tasks: Vec<Task>,
    pub workflow_logs: Vec<WorkflowLog>,
    pub inputs: BTreeMap<String, Value>,
    pub env: BTreeMap<String, String>,
    pub workflow_memory: BTreeMap<String, Value>,
    pub workflow_status: WorkflowStatus,
    pub workflow_result: Option<Value>,
    pub max_concurrency: usize,
}

impl TeamState {
    fn new(name: String) -> Self {
        Self {
            name,
            agents: Vec::new(),
            tasks: Vec::new(),
            workflow_logs: Vec::new(),
            inputs: BTreeMap::new(),
            env: BTreeMap::new(),
            workflow_memory: BTreeMap::new(),
            workflow_status: WorkflowStatus::Initial,
            workflow_result: None,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }

    /// Append a log entry, clamping the timestamp so the log stays
    /// non-decreasing even if the system clock steps backwards
    fn append_log(&mut self, mut log: WorkflowLog) {
        if let Some(last) = self.workflow_logs.last()
            && log.timestamp < last.timestamp
        {
            log.timestamp = last.timestamp;
        }
        self.workflow_logs.push(log);
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == id)
    }

    fn task_mut(&mut self, id: &str) -> Result<&mut Task, WorkflowError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| WorkflowError::UnknownTask(id.to_string()))
    }

    fn agent_mut(&mut self, id: &str) -> Result<&mut Agent, WorkflowError> {
        self.agents
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| WorkflowError::UnknownAgent(id.to_string()))
    }

    /// Count of tasks currently being executed
    pub fn doing_count(&self) -> usize {
        self.tasks.iter().filter(|t| t.status == TaskStatus::Doing).count()
    }

    /// True when every task is in a terminal state
    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.iter().all(|t| t.is_terminal())
    }
}

/// A registered subscriber: the probe closure owns the selector, the
/// previous projection, and the reaction
struct Subscriber {
    id: u64,
    probe: Mutex<Box<dyn FnMut(&TeamState) + Send>>,
}

struct StoreInner {
    state: Mutex<TeamState>,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    pending: Mutex<VecDeque<TeamState>>,
    draining: AtomicBool,
    next_subscriber_id: AtomicU64,
    status_tx: watch::Sender<WorkflowStatus>,
}

/// Handle returned by `TeamStore::subscribe`
///
/// The subscription stays active until `unsubscribe` is called; dropping
/// the handle alone does not remove it.
pub struct Subscription {
    store: Weak<StoreInner>,
    id: u64,
}

impl Subscription {
    /// Remove this subscriber from the store
    pub fn unsubscribe(self) {
        if let Some(inner) = self.store.upgrade() {
            let mut subs = inner.subscribers.lock().expect("subscriber table lock");
            subs.retain(|s| s.id != self.id);
        }
    }
}

/// Cheaply cloneable handle to the shared team state
#[derive(Clone)]
pub struct TeamStore {
    inner: Arc<StoreInner>,
}

impl TeamStore {
    pub fn new(name: impl Into<String>) -> Self {
        let (status_tx, _) = watch::channel(WorkflowStatus::Initial);
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(TeamState::new(name.into())),
                subscribers: Mutex::new(Vec::new()),
                pending: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                next_subscriber_id: AtomicU64::new(1),
                status_tx,
            }),
        }
    }

    // === Commit machinery ===

    /// Run a mutation under the state lock; on success, notify
    /// subscribers with the post-commit snapshot
    fn commit<R>(&self, mutate: impl FnOnce(&mut TeamState) -> Result<R, WorkflowError>) -> Result<R, WorkflowError> {
        let (result, snapshot) = {
            let mut state = self.inner.state.lock().expect("team state lock");
            match mutate(&mut state) {
                Ok(r) => (r, state.clone()),
                Err(e) => {
                    warn!(error = %e, "commit: mutation precondition failed");
                    return Err(e);
                }
            }
        };

        self.inner.pending.lock().expect("pending queue lock").push_back(snapshot);
        self.drain_notifications();
        Ok(result)
    }

    /// Process queued snapshots one at a time
    ///
    /// Only one frame drains at a time; commits made from inside a
    /// reaction enqueue their snapshot and return, and the outer frame
    /// picks them up in order.
    fn drain_notifications(&self) {
        loop {
            if self.inner.draining.swap(true, Ordering::SeqCst) {
                return;
            }
            while let Some(snapshot) = {
                let mut pending = self.inner.pending.lock().expect("pending queue lock");
                pending.pop_front()
            } {
                self.notify_all(&snapshot);
            }
            self.inner.draining.store(false, Ordering::SeqCst);

            let empty = self.inner.pending.lock().expect("pending queue lock").is_empty();
            if empty {
                return;
            }
            // A racing commit slipped in between the drain and the flag
            // reset; loop and pick it up.
        }
    }

    fn notify_all(&self, snapshot: &TeamState) {
        let subscribers: Vec<Arc<Subscriber>> = self.inner.subscribers.lock().expect("subscriber table lock").clone();
        for subscriber in subscribers {
            // A probe that panicked earlier leaves its mutex poisoned;
            // such subscribers stay isolated and are skipped.
            let mut probe = match subscriber.probe.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    debug!(subscriber_id = subscriber.id, "skipping poisoned subscriber");
                    continue;
                }
            };
            let outcome = catch_unwind(AssertUnwindSafe(|| (*probe)(snapshot)));
            if outcome.is_err() {
                error!(subscriber_id = subscriber.id, "subscriber panicked; isolating");
            }
        }
    }

    /// Register a selector-scoped subscriber
    ///
    /// The reaction fires only when the selector's projection changes
    /// (compared with `PartialEq` against the previous projection), and
    /// receives the new projection, the previous one, and the post-commit
    /// snapshot it was computed from.
    pub fn subscribe<P, S, R>(&self, selector: S, mut reaction: R) -> Subscription
    where
        P: PartialEq + Send + 'static,
        S: Fn(&TeamState) -> P + Send + 'static,
        R: FnMut(&P, Option<&P>, &TeamState) + Send + 'static,
    {
        let mut prev: Option<P> = {
            let state = self.inner.state.lock().expect("team state lock");
            Some(selector(&state))
        };

        let probe = Box::new(move |state: &TeamState| {
            let next = selector(state);
            let changed = prev.as_ref().map(|p| *p != next).unwrap_or(true);
            if changed {
                reaction(&next, prev.as_ref(), state);
                prev = Some(next);
            }
        });

        let id = self.inner.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .subscribers
            .lock()
            .expect("subscriber table lock")
            .push(Arc::new(Subscriber {
                id,
                probe: Mutex::new(probe),
            }));

        Subscription {
            store: Arc::downgrade(&self.inner),
            id,
        }
    }

    // === Read accessors ===

    /// Clone of the full current state
    pub fn state(&self) -> TeamState {
        self.inner.state.lock().expect("team state lock").clone()
    }

    pub fn workflow_status(&self) -> WorkflowStatus {
        self.inner.state.lock().expect("team state lock").workflow_status
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.inner.state.lock().expect("team state lock").task(id).cloned()
    }

    pub fn agent(&self, id: &str) -> Option<Agent> {
        self.inner.state.lock().expect("team state lock").agent(id).cloned()
    }

    pub fn logs(&self) -> Vec<WorkflowLog> {
        self.inner.state.lock().expect("team state lock").workflow_logs.clone()
    }

    /// Watch channel following the workflow status
    pub fn status_watch(&self) -> watch::Receiver<WorkflowStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Redacted, time-independent snapshot for deterministic comparison
    pub fn get_cleaned_state(&self) -> Value {
        let state = self.inner.state.lock().expect("team state lock");
        cleaned_state(&state)
    }

    /// Fold the logs since the latest RUNNING transition into usage stats
    pub fn get_workflow_stats(&self) -> WorkflowStats {
        let state = self.inner.state.lock().expect("team state lock");
        compute_workflow_stats(&state.workflow_logs)
    }

    // === Setup mutators (before start) ===

    /// Add agents to the team; only valid before the workflow starts
    pub fn add_agents(&self, agents: Vec<Agent>) -> Result<(), WorkflowError> {
        self.commit(|state| {
            if state.workflow_status != WorkflowStatus::Initial {
                return Err(WorkflowError::InvalidState(
                    "agents can only be added before the workflow starts".to_string(),
                ));
            }
            for agent in &agents {
                if state.agent(&agent.id).is_some() {
                    return Err(WorkflowError::InvalidState(format!("duplicate agent id: {}", agent.id)));
                }
            }
            state.agents.extend(agents);
            Ok(())
        })
    }

    /// Add tasks to the team; only valid before the workflow starts
    pub fn add_tasks(&self, tasks: Vec<Task>) -> Result<(), WorkflowError> {
        self.commit(|state| {
            if state.workflow_status != WorkflowStatus::Initial {
                return Err(WorkflowError::InvalidState(
                    "tasks can only be added before the workflow starts".to_string(),
                ));
            }
            for task in &tasks {
                if state.task(&task.id).is_some() || tasks.iter().filter(|t| t.id == task.id).count() > 1 {
                    return Err(WorkflowError::DuplicateTaskId(task.id.clone()));
                }
                if state.agent(&task.agent_id).is_none() {
                    return Err(WorkflowError::UnknownAgent(task.agent_id.clone()));
                }
            }
            state.tasks.extend(tasks);
            Ok(())
        })
    }

    /// Merge placeholder inputs into the store
    pub fn merge_inputs(&self, inputs: BTreeMap<String, Value>) {
        let _ = self.commit(|state| {
            state.inputs.extend(inputs);
            Ok(())
        });
    }

    pub fn set_env(&self, env: BTreeMap<String, String>) {
        let _ = self.commit(|state| {
            state.env = env;
            Ok(())
        });
    }

    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        let _ = self.commit(|state| {
            state.max_concurrency = max_concurrency.max(1);
            Ok(())
        });
    }

    // === Run lifecycle mutators ===

    /// Reset run state, merge inputs, and transition to RUNNING
    pub fn begin_run(&self, inputs: Option<BTreeMap<String, Value>>) -> Result<(), WorkflowError> {
        let result = self.commit(|state| {
            match state.workflow_status {
                WorkflowStatus::Running | WorkflowStatus::Paused | WorkflowStatus::Stopping => {
                    return Err(WorkflowError::AlreadyRunning);
                }
                _ => {}
            }

            if let Some(inputs) = inputs {
                state.inputs.extend(inputs);
            }

            state.workflow_logs.clear();
            state.workflow_result = None;
            state.workflow_memory.clear();
            for task in &mut state.tasks {
                task.status = TaskStatus::Todo;
                task.result = None;
                task.interpolated_description = None;
                task.feedback_history.clear();
                task.executing_agent_id = None;
                task.execution_epoch = 0;
            }
            for agent in &mut state.agents {
                agent.status = AgentStatus::Initial;
                agent.interactions.clear();
                agent.current_iterations = 0;
            }

            // When no task is flagged, the last task is the workflow
            // deliverable; finishing requires a completed deliverable
            if !state.tasks.iter().any(|t| t.is_deliverable)
                && let Some(last) = state.tasks.last_mut()
            {
                last.is_deliverable = true;
            }

            state.workflow_status = WorkflowStatus::Running;
            let log = WorkflowLog::workflow(WorkflowStatus::Running, "Workflow started", serde_json::json!({}));
            state.append_log(log);
            Ok(())
        });
        if result.is_ok() {
            self.inner.status_tx.send_replace(WorkflowStatus::Running);
        }
        result
    }

    /// Cache interpolated task descriptions computed from the inputs
    pub fn cache_interpolated_descriptions(&self, descriptions: Vec<(String, String)>) {
        let _ = self.commit(|state| {
            for (task_id, text) in descriptions {
                if let Ok(task) = state.task_mut(&task_id) {
                    task.interpolated_description = Some(text);
                }
            }
            Ok(())
        });
    }

    /// Transition the workflow status and emit a log
    pub fn set_workflow_status(&self, status: WorkflowStatus, description: impl Into<String>) {
        let description = description.into();
        let result = self.commit(|state| {
            state.workflow_status = status;
            let log = WorkflowLog::workflow(status, description, serde_json::json!({}));
            state.append_log(log);
            Ok(())
        });
        if result.is_ok() {
            self.inner.status_tx.send_replace(status);
        }
    }

    pub fn set_workflow_result(&self, result: Option<Value>) {
        let _ = self.commit(|state| {
            state.workflow_result = result;
            Ok(())
        });
    }

    // === Task mutators ===

    /// Atomically transition a task's status
    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<(), WorkflowError> {
        self.commit(|state| {
            let task = state.task_mut(id)?;
            let previous = task.status;
            task.status = status;
            let description = format!("Task {}: {} -> {}", task.id, previous, status);
            let log = WorkflowLog::task(
                &state.tasks.iter().find(|t| t.id == id).cloned().expect("task present"),
                description,
                serde_json::json!({ "previous_status": previous.as_str() }),
            );
            state.append_log(log);
            Ok(())
        })
    }

    /// Atomically transition several tasks to the same status
    pub fn update_status_of_multiple_tasks(&self, ids: &[String], status: TaskStatus) -> Result<(), WorkflowError> {
        self.commit(|state| {
            for id in ids {
                if state.task(id).is_none() {
                    return Err(WorkflowError::UnknownTask(id.clone()));
                }
            }
            for id in ids {
                let task = state.task_mut(id)?;
                let previous = task.status;
                task.status = status;
                let snapshot = state.tasks.iter().find(|t| t.id == *id).cloned().expect("task present");
                let description = format!("Task {}: {} -> {}", snapshot.id, previous, status);
                let log = WorkflowLog::task(
                    &snapshot,
                    description,
                    serde_json::json!({ "previous_status": previous.as_str() }),
                );
                state.append_log(log);
            }
            Ok(())
        })
    }

    /// Mark a task DOING, record its executing agent, and bump its
    /// execution epoch
    ///
    /// Returns the new epoch; work items carry it so stale dispatches can
    /// be recognized and dropped at iteration boundaries.
    pub fn dispatch_task(&self, id: &str, executing_agent_id: &str) -> Result<u64, WorkflowError> {
        self.commit(|state| {
            if state.agent(executing_agent_id).is_none() {
                return Err(WorkflowError::UnknownAgent(executing_agent_id.to_string()));
            }
            let task = state.task_mut(id)?;
            let previous = task.status;
            task.status = TaskStatus::Doing;
            task.executing_agent_id = Some(executing_agent_id.to_string());
            task.execution_epoch += 1;
            let epoch = task.execution_epoch;
            let snapshot = state.tasks.iter().find(|t| t.id == id).cloned().expect("task present");
            let description = format!("Task {}: {} -> {}", snapshot.id, previous, TaskStatus::Doing);
            let log = WorkflowLog::task(
                &snapshot,
                description,
                serde_json::json!({ "previous_status": previous.as_str(), "execution_epoch": epoch }),
            );
            state.append_log(log);
            Ok(epoch)
        })
    }

    /// Record a task result and its completion status
    pub fn record_task_result(&self, id: &str, result: Value, status: TaskStatus) -> Result<(), WorkflowError> {
        self.commit(|state| {
            let task = state.task_mut(id)?;
            let previous = task.status;
            task.result = Some(result.clone());
            task.status = status;
            let snapshot = state.tasks.iter().find(|t| t.id == id).cloned().expect("task present");
            let description = format!("Task {}: {} -> {}", snapshot.id, previous, status);
            let log = WorkflowLog::task(
                &snapshot,
                description,
                serde_json::json!({ "previous_status": previous.as_str(), "result": result }),
            );
            state.append_log(log);
            Ok(())
        })
    }

    /// Append human feedback and force the task into REVISE
    pub fn provide_feedback(&self, id: &str, content: impl Into<String>) -> Result<(), WorkflowError> {
        let content = content.into();
        self.commit(|state| {
            if matches!(
                state.workflow_status,
                WorkflowStatus::Stopping | WorkflowStatus::Stopped | WorkflowStatus::Errored
            ) {
                return Err(WorkflowError::InvalidState(format!(
                    "cannot provide feedback while workflow is {}",
                    state.workflow_status
                )));
            }
            let task = state.task_mut(id)?;
            let previous = task.status;
            task.feedback_history.push(Feedback::new(content.clone()));
            task.status = TaskStatus::Revise;
            let snapshot = state.tasks.iter().find(|t| t.id == id).cloned().expect("task present");
            let description = format!("Task {}: feedback received, {} -> {}", snapshot.id, previous, TaskStatus::Revise);
            let log = WorkflowLog::task(
                &snapshot,
                description,
                serde_json::json!({ "previous_status": previous.as_str(), "feedback": content }),
            );
            state.append_log(log);
            Ok(())
        })
    }

    /// Approve a task awaiting external validation
    pub fn validate_task(&self, id: &str) -> Result<(), WorkflowError> {
        self.commit(|state| {
            let task = state.task_mut(id)?;
            if task.status != TaskStatus::AwaitingValidation {
                return Err(WorkflowError::InvalidState(format!(
                    "task {} is {} but validation requires {}",
                    id,
                    task.status,
                    TaskStatus::AwaitingValidation
                )));
            }
            task.status = TaskStatus::Validated;
            let snapshot = state.tasks.iter().find(|t| t.id == id).cloned().expect("task present");
            let description = format!("Task {}: {} -> {}", snapshot.id, TaskStatus::AwaitingValidation, TaskStatus::Validated);
            let log = WorkflowLog::task(&snapshot, description, serde_json::json!({}));
            state.append_log(log);
            Ok(())
        })
    }

    /// Mark all pending feedback on a task as processed, returning the contents
    pub fn consume_pending_feedback(&self, id: &str) -> Result<Vec<String>, WorkflowError> {
        self.commit(|state| {
            let task = state.task_mut(id)?;
            let mut contents = Vec::new();
            for entry in &mut task.feedback_history {
                if entry.status == crate::domain::FeedbackStatus::Pending {
                    contents.push(entry.content.clone());
                    entry.status = crate::domain::FeedbackStatus::Processed;
                }
            }
            Ok(contents)
        })
    }

    // === Agent mutators ===

    /// Register a runtime clone of a busy agent
    pub fn register_agent_clone(&self, agent: Agent) {
        debug!(agent_id = %agent.id, name = %agent.name, "registering agent clone");
        let _ = self.commit(|state| {
            state.agents.push(agent);
            Ok(())
        });
    }

    /// Transition an agent's status and emit an AgentStatusUpdate log
    pub fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
        task_id: Option<&str>,
        description: impl Into<String>,
        metadata: Value,
    ) -> Result<(), WorkflowError> {
        let description = description.into();
        self.commit(|state| {
            let agent = state.agent_mut(agent_id)?;
            agent.status = status;
            let agent_snapshot = state.agent(agent_id).cloned().expect("agent present");
            let task_snapshot = task_id.and_then(|id| state.task(id).cloned());
            let description = if description.is_empty() {
                format!("Agent {}: {}", agent_snapshot.name, status)
            } else {
                description
            };
            let log = WorkflowLog::agent(&agent_snapshot, task_snapshot.as_ref(), description, metadata);
            state.append_log(log);
            Ok(())
        })
    }

    /// Checkpoint an agent's chat history and iteration counter
    ///
    /// Called at iteration boundaries so a paused task can resume from
    /// where it left off.
    pub fn checkpoint_agent(
        &self,
        agent_id: &str,
        interactions: Vec<ChatMessage>,
        current_iterations: u32,
    ) -> Result<(), WorkflowError> {
        self.commit(|state| {
            let agent = state.agent_mut(agent_id)?;
            agent.interactions = interactions;
            agent.current_iterations = current_iterations;
            Ok(())
        })
    }

    // === Workflow memory ===

    /// Write to the cross-task scratchpad
    pub fn set_memory(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        let _ = self.commit(|state| {
            state.workflow_memory.insert(key, value);
            Ok(())
        });
    }

    /// Read from the cross-task scratchpad
    pub fn get_memory(&self, key: &str) -> Option<Value> {
        self.inner
            .state
            .lock()
            .expect("team state lock")
            .workflow_memory
            .get(key)
            .cloned()
    }
}
