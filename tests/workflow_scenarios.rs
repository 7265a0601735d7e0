//! End-to-end workflow scenarios
//!
//! These tests drive full teams against scripted mock LLMs and assert on
//! the recorded workflow log: ordering, concurrency windows, revision
//! ripples, pause/resume, and stop semantics.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use teamflow::{
    Agent, AgentStatus, MockLlmClient, Task, TaskStatus, Team, WorkflowError, WorkflowLog, WorkflowLogKind,
    WorkflowStatus,
};

// =============================================================================
// Helpers
// =============================================================================

fn final_answer(text: &str) -> String {
    format!("{{\"finalAnswer\": \"{}\"}}", text)
}

fn worker(id: &str, llm: Arc<MockLlmClient>) -> Agent {
    Agent::new(id, "Worker", "Complete assigned tasks", llm).with_id(id)
}

/// Poll a condition until it holds (10s ceiling)
async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met within 10s");
}

/// Index of the first log recording `task_id` entering `status`
fn task_status_index(logs: &[WorkflowLog], task_id: &str, status: TaskStatus) -> Option<usize> {
    logs.iter().position(|log| {
        log.kind == WorkflowLogKind::TaskStatusUpdate
            && log.task.as_ref().map(|t| (t.id.as_str(), t.status)) == Some((task_id, status))
    })
}

/// Indices of every log recording `task_id` entering `status`
fn task_status_indices(logs: &[WorkflowLog], task_id: &str, status: TaskStatus) -> Vec<usize> {
    logs.iter()
        .enumerate()
        .filter(|(_, log)| {
            log.kind == WorkflowLogKind::TaskStatusUpdate
                && log.task.as_ref().map(|t| (t.id.as_str(), t.status)) == Some((task_id, status))
        })
        .map(|(i, _)| i)
        .collect()
}

fn agent_status_count(logs: &[WorkflowLog], status: AgentStatus) -> usize {
    logs.iter().filter(|log| log.agent_status() == Some(status)).count()
}

fn workflow_status_count(logs: &[WorkflowLog], status: WorkflowStatus) -> usize {
    logs.iter()
        .filter(|log| log.kind == WorkflowLogKind::WorkflowStatusUpdate && log.workflow_status == Some(status))
        .count()
}

/// Peak number of tasks simultaneously DOING, folded over the log
fn peak_concurrent_doing(logs: &[WorkflowLog]) -> usize {
    let mut active: HashSet<String> = HashSet::new();
    let mut peak = 0;
    for log in logs {
        if log.kind != WorkflowLogKind::TaskStatusUpdate {
            continue;
        }
        let Some(task) = log.task.as_ref() else { continue };
        if task.status == TaskStatus::Doing {
            active.insert(task.id.clone());
        } else {
            active.remove(&task.id);
        }
        peak = peak.max(active.len());
    }
    peak
}

/// True when the two tasks were DOING at the same time at least once
fn doing_windows_overlap(logs: &[WorkflowLog], a: &str, b: &str) -> bool {
    let a_start = task_status_index(logs, a, TaskStatus::Doing);
    let b_start = task_status_index(logs, b, TaskStatus::Doing);
    let a_end = task_status_index(logs, a, TaskStatus::Done);
    let b_end = task_status_index(logs, b, TaskStatus::Done);
    match (a_start, b_start, a_end, b_end) {
        (Some(a_start), Some(b_start), Some(a_end), Some(b_end)) => a_start < b_end && b_start < a_end,
        _ => false,
    }
}

// =============================================================================
// S1 - Linear two-task sequence
// =============================================================================

#[tokio::test]
async fn s1_linear_two_task_sequence() {
    let llm = Arc::new(MockLlmClient::new([
        final_answer("extract-result"),
        final_answer("summary-result"),
    ]));
    let team = Team::builder("linear")
        .agents([worker("a1", llm)])
        .tasks([
            Task::new("extract the entities", "entity list", "a1").with_id("extract"),
            Task::new("summarize the entities", "summary", "a1").with_id("summarize"),
        ])
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    let completion = team.wait_until_settled().await;

    assert_eq!(completion.status, WorkflowStatus::Finished);
    assert_eq!(completion.result, Some(json!("summary-result")));

    let logs = team.workflow_logs();
    let started = logs
        .iter()
        .position(|l| l.workflow_status == Some(WorkflowStatus::Running))
        .unwrap();
    let a_doing = task_status_index(&logs, "extract", TaskStatus::Doing).unwrap();
    let a_done = task_status_index(&logs, "extract", TaskStatus::Done).unwrap();
    let b_doing = task_status_index(&logs, "summarize", TaskStatus::Doing).unwrap();
    let b_done = task_status_index(&logs, "summarize", TaskStatus::Done).unwrap();
    let finished = logs
        .iter()
        .position(|l| l.workflow_status == Some(WorkflowStatus::Finished))
        .unwrap();

    assert!(started < a_doing);
    assert!(a_doing < a_done);
    assert!(a_done < b_doing);
    assert!(b_doing < b_done);
    assert!(b_done < finished);

    // One iteration each
    assert_eq!(agent_status_count(&logs, AgentStatus::IterationStart), 2);
    assert_eq!(agent_status_count(&logs, AgentStatus::FinalAnswer), 2);

    // Log timestamps never decrease
    for pair in logs.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

// =============================================================================
// S2 - Diamond DAG
// =============================================================================

#[tokio::test]
async fn s2_diamond_dag_runs_middle_tasks_concurrently() {
    let llm1 = Arc::new(
        MockLlmClient::new([final_answer("a-result"), final_answer("b-result"), final_answer("d-result")])
            .with_delay(Duration::from_millis(50)),
    );
    let llm2 = Arc::new(MockLlmClient::new([final_answer("c-result")]).with_delay(Duration::from_millis(50)));

    let team = Team::builder("diamond")
        .agents([worker("a1", llm1), worker("a2", llm2)])
        .tasks([
            Task::new("root work", "out", "a1").with_id("a"),
            Task::new("left branch", "out", "a1").with_id("b").with_depends_on(["a"]),
            Task::new("right branch", "out", "a2").with_id("c").with_depends_on(["a"]),
            Task::new("join results", "out", "a1")
                .with_id("d")
                .with_depends_on(["b", "c"]),
        ])
        .max_concurrency(2)
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    let completion = team.wait_until_settled().await;
    assert_eq!(completion.status, WorkflowStatus::Finished);
    assert_eq!(completion.result, Some(json!("d-result")));

    let logs = team.workflow_logs();

    // A runs alone, then B and C concurrently, then D alone
    let a_done = task_status_index(&logs, "a", TaskStatus::Done).unwrap();
    let b_doing = task_status_index(&logs, "b", TaskStatus::Doing).unwrap();
    let c_doing = task_status_index(&logs, "c", TaskStatus::Doing).unwrap();
    let b_done = task_status_index(&logs, "b", TaskStatus::Done).unwrap();
    let c_done = task_status_index(&logs, "c", TaskStatus::Done).unwrap();
    let d_doing = task_status_index(&logs, "d", TaskStatus::Doing).unwrap();

    assert!(a_done < b_doing && a_done < c_doing);
    assert!(doing_windows_overlap(&logs, "b", "c"));
    assert!(b_done < d_doing && c_done < d_doing);

    // Concurrency ceiling respected
    assert!(peak_concurrent_doing(&logs) <= 2);

    // Dependency respect: every DOING is preceded by DONE of all deps
    let deps: BTreeMap<&str, Vec<&str>> =
        BTreeMap::from([("a", vec![]), ("b", vec!["a"]), ("c", vec!["a"]), ("d", vec!["b", "c"])]);
    for (task_id, task_deps) in deps {
        let doing = task_status_index(&logs, task_id, TaskStatus::Doing).unwrap();
        for dep in task_deps {
            let dep_done = task_status_index(&logs, dep, TaskStatus::Done).unwrap();
            assert!(dep_done < doing, "{} ran before its dependency {} completed", task_id, dep);
        }
    }
}

// =============================================================================
// S3 - Cycle rejection
// =============================================================================

#[tokio::test]
async fn s3_cycle_in_dependencies_errors_the_workflow() {
    let llm = Arc::new(MockLlmClient::always(final_answer("never")));
    let team = Team::builder("cyclic")
        .agents([worker("a1", llm)])
        .tasks([
            Task::new("first", "out", "a1").with_id("a").with_depends_on(["b"]),
            Task::new("second", "out", "a1").with_id("b").with_depends_on(["a"]),
        ])
        .build()
        .unwrap();

    let error = team.start(None).await.unwrap_err();
    assert!(matches!(error, WorkflowError::CycleInDependencies { .. }));
    assert!(error.to_string().starts_with("CYCLE_IN_DEPENDENCIES"));
    assert_eq!(team.workflow_status(), WorkflowStatus::Errored);

    // No task ever became DOING
    let logs = team.workflow_logs();
    assert!(task_status_index(&logs, "a", TaskStatus::Doing).is_none());
    assert!(task_status_index(&logs, "b", TaskStatus::Doing).is_none());
}

// =============================================================================
// S4 - Feedback under hierarchy
// =============================================================================

#[tokio::test]
async fn s4_feedback_ripples_through_hierarchy() {
    let llm = Arc::new(MockLlmClient::always(final_answer("result")));
    let team = Team::builder("chain")
        .agents([worker("a1", llm)])
        .tasks([
            Task::new("gather", "out", "a1").with_id("a"),
            Task::new("analyze", "out", "a1").with_id("b").with_depends_on(["a"]),
            Task::new("report", "out", "a1").with_id("c").with_depends_on(["b"]),
        ])
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    let completion = team.wait_until_settled().await;
    assert_eq!(completion.status, WorkflowStatus::Finished);

    team.provide_feedback("a", "redo").unwrap();
    wait_until(|| workflow_status_count(&team.workflow_logs(), WorkflowStatus::Finished) >= 2).await;

    let logs = team.workflow_logs();
    let revise = task_status_index(&logs, "a", TaskStatus::Revise).unwrap();
    let b_blocked = task_status_index(&logs, "b", TaskStatus::Blocked).unwrap();
    let c_blocked = task_status_index(&logs, "c", TaskStatus::Blocked).unwrap();
    let a_dones = task_status_indices(&logs, "a", TaskStatus::Done);
    let b_todos = task_status_indices(&logs, "b", TaskStatus::Todo);
    let b_dones = task_status_indices(&logs, "b", TaskStatus::Done);
    let c_dones = task_status_indices(&logs, "c", TaskStatus::Done);

    // Dependents were blocked before the revised task re-ran to DONE
    assert!(revise < b_blocked && revise < c_blocked);
    assert_eq!(a_dones.len(), 2, "a completes twice");
    assert!(b_blocked < a_dones[1]);

    // After a's revision, b returned to TODO, then re-ran; c followed
    let b_restored = *b_todos.last().unwrap();
    assert!(a_dones[1] < b_restored);
    assert_eq!(b_dones.len(), 2);
    assert_eq!(c_dones.len(), 2);
    assert!(b_dones[1] < c_dones[1]);

    // Everything settled DONE
    for id in ["a", "b", "c"] {
        assert_eq!(team.task_status(id), Some(TaskStatus::Done));
    }

    // Feedback consumed
    let task_a = team.store().task("a").unwrap();
    assert!(task_a.pending_feedback().is_empty());
    assert_eq!(task_a.feedback_history.len(), 1);
}

// =============================================================================
// S5 - Max iterations
// =============================================================================

#[tokio::test]
async fn s5_unparseable_output_exhausts_iterations_and_blocks() {
    let llm = Arc::new(MockLlmClient::always("I cannot answer in the required format"));
    let agent = worker("a1", llm).with_max_iterations(3);
    let team = Team::builder("stuck")
        .agents([agent])
        .tasks([Task::new("impossible", "out", "a1").with_id("t1")])
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    let completion = team.wait_until_settled().await;

    assert_eq!(completion.status, WorkflowStatus::Blocked);
    assert_eq!(team.task_status("t1"), Some(TaskStatus::Blocked));

    let logs = team.workflow_logs();
    assert_eq!(agent_status_count(&logs, AgentStatus::IterationEnd), 3);
    assert_eq!(agent_status_count(&logs, AgentStatus::IssuesParsingLlmOutput), 3);
    assert_eq!(agent_status_count(&logs, AgentStatus::MaxIterationsError), 1);
}

// =============================================================================
// S6 - Human validation
// =============================================================================

#[tokio::test]
async fn s6_external_validation_gates_completion() {
    let llm = Arc::new(MockLlmClient::new([final_answer("validated-answer")]));
    let team = Team::builder("validated")
        .agents([worker("a1", llm)])
        .tasks([Task::new("important work", "out", "a1")
            .with_id("t1")
            .with_external_validation()])
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    let completion = team.wait_until_settled().await;

    // Final answer parks the task, the workflow does not finish
    assert_eq!(completion.status, WorkflowStatus::Blocked);
    assert_eq!(team.task_status("t1"), Some(TaskStatus::AwaitingValidation));

    team.validate_task("t1").unwrap();
    wait_until(|| team.workflow_status() == WorkflowStatus::Finished).await;

    assert_eq!(team.task_status("t1"), Some(TaskStatus::Validated));
    let state = team.store().state();
    assert_eq!(state.workflow_result, Some(json!("validated-answer")));
}

// =============================================================================
// Sequential revision
// =============================================================================

#[tokio::test]
async fn sequential_revise_resets_every_later_task() {
    let llm = Arc::new(MockLlmClient::always(final_answer("result")));
    let team = Team::builder("pipeline")
        .agents([worker("a1", llm)])
        .tasks([
            Task::new("one", "out", "a1").with_id("t1"),
            Task::new("two", "out", "a1").with_id("t2"),
            Task::new("three", "out", "a1").with_id("t3"),
        ])
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    let completion = team.wait_until_settled().await;
    assert_eq!(completion.status, WorkflowStatus::Finished);

    team.provide_feedback("t1", "do it differently").unwrap();
    wait_until(|| workflow_status_count(&team.workflow_logs(), WorkflowStatus::Finished) >= 2).await;

    let logs = team.workflow_logs();
    let revise = task_status_index(&logs, "t1", TaskStatus::Revise).unwrap();
    let t1_dones = task_status_indices(&logs, "t1", TaskStatus::Done);
    let t2_dones = task_status_indices(&logs, "t2", TaskStatus::Done);
    let t3_dones = task_status_indices(&logs, "t3", TaskStatus::Done);

    // Later tasks were reset after the revision
    let t2_reset = task_status_indices(&logs, "t2", TaskStatus::Todo)
        .into_iter()
        .find(|&i| i > revise)
        .expect("t2 reset to TODO after revision");
    let t3_reset = task_status_indices(&logs, "t3", TaskStatus::Todo)
        .into_iter()
        .find(|&i| i > revise)
        .expect("t3 reset to TODO after revision");

    // No later task completed again before t1 completed its revision
    assert_eq!(t1_dones.len(), 2);
    assert_eq!(t2_dones.len(), 2);
    assert_eq!(t3_dones.len(), 2);
    assert!(t2_reset < t2_dones[1]);
    assert!(t3_reset < t3_dones[1]);
    assert!(t1_dones[1] < t2_dones[1]);
    assert!(t2_dones[1] < t3_dones[1]);
}

// =============================================================================
// Pause / resume
// =============================================================================

#[tokio::test]
async fn pause_checkpoints_and_resume_completes() {
    let llm = Arc::new(
        MockLlmClient::new([
            "{\"observation\": \"surveying the input\"}".to_string(),
            final_answer("finished-after-resume"),
        ])
        .with_delay(Duration::from_millis(100)),
    );
    let team = Team::builder("pausable")
        .agents([worker("a1", llm)])
        .tasks([Task::new("long job", "out", "a1").with_id("t1")])
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    team.pause().unwrap();
    assert_eq!(team.workflow_status(), WorkflowStatus::Paused);

    // The in-flight iteration finishes its LLM call, then checkpoints
    team.wait_for_task_status("t1", TaskStatus::Paused).await.unwrap();
    let paused_agent = team.store().agent("a1").unwrap();
    assert!(!paused_agent.interactions.is_empty(), "history checkpointed on pause");

    team.resume().unwrap();
    let completion = team.wait_until_settled().await;
    assert_eq!(completion.status, WorkflowStatus::Finished);
    assert_eq!(completion.result, Some(json!("finished-after-resume")));

    let logs = team.workflow_logs();
    assert!(agent_status_count(&logs, AgentStatus::Paused) >= 1);
    assert!(task_status_index(&logs, "t1", TaskStatus::Resumed).is_some());
    let paused_idx = task_status_index(&logs, "t1", TaskStatus::Paused).unwrap();
    let resumed_idx = task_status_index(&logs, "t1", TaskStatus::Resumed).unwrap();
    let done_idx = task_status_index(&logs, "t1", TaskStatus::Done).unwrap();
    assert!(paused_idx < resumed_idx && resumed_idx < done_idx);
}

// =============================================================================
// Stop
// =============================================================================

#[tokio::test]
async fn stop_aborts_in_flight_and_preserves_pending() {
    let llm = Arc::new(MockLlmClient::always(final_answer("result")).with_delay(Duration::from_millis(100)));
    let team = Team::builder("stoppable")
        .agents([worker("a1", llm)])
        .tasks([
            Task::new("first", "out", "a1").with_id("t1"),
            Task::new("second", "out", "a1").with_id("t2"),
        ])
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    team.stop().await.unwrap();

    assert_eq!(team.workflow_status(), WorkflowStatus::Stopped);
    assert_eq!(team.task_status("t1"), Some(TaskStatus::Aborted));
    assert_eq!(team.task_status("t2"), Some(TaskStatus::Todo));

    let logs = team.workflow_logs();
    assert!(workflow_status_count(&logs, WorkflowStatus::Stopping) == 1);
    assert!(workflow_status_count(&logs, WorkflowStatus::Stopped) == 1);
}

// =============================================================================
// Agent cloning
// =============================================================================

#[tokio::test]
async fn busy_agent_is_cloned_for_parallel_tasks() {
    let llm = Arc::new(MockLlmClient::always(final_answer("result")).with_delay(Duration::from_millis(50)));
    let team = Team::builder("cloning")
        .agents([worker("a1", llm)])
        .tasks([
            Task::new("root", "out", "a1").with_id("r"),
            Task::new("left", "out", "a1").with_id("c1").with_depends_on(["r"]),
            Task::new("right", "out", "a1")
                .with_id("c2")
                .with_depends_on(["r"])
                .with_parallel_execution(),
        ])
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    let completion = team.wait_until_settled().await;
    assert_eq!(completion.status, WorkflowStatus::Finished);

    // A clone with a fresh history was registered for the second branch
    let state = team.store().state();
    assert_eq!(state.agents.len(), 2);
    assert!(doing_windows_overlap(&team.workflow_logs(), "c1", "c2"));

    let c2 = state.tasks.iter().find(|t| t.id == "c2").unwrap();
    assert_ne!(c2.executing_agent_id.as_deref(), Some("a1"));
}

#[tokio::test]
async fn busy_agent_serializes_tasks_without_parallel_flag() {
    let llm = Arc::new(MockLlmClient::always(final_answer("result")).with_delay(Duration::from_millis(30)));
    let team = Team::builder("serialized")
        .agents([worker("a1", llm)])
        .tasks([
            Task::new("root", "out", "a1").with_id("r"),
            Task::new("left", "out", "a1").with_id("c1").with_depends_on(["r"]),
            Task::new("right", "out", "a1").with_id("c2").with_depends_on(["r"]),
        ])
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    let completion = team.wait_until_settled().await;
    assert_eq!(completion.status, WorkflowStatus::Finished);

    let state = team.store().state();
    assert_eq!(state.agents.len(), 1, "no clone without the parallel flag");
    assert!(!doing_windows_overlap(&team.workflow_logs(), "c1", "c2"));
}

// =============================================================================
// Manager-LLM strategy
// =============================================================================

#[tokio::test]
async fn manager_strategy_orders_tasks_by_supervisor_choice() {
    let supervisor_llm = Arc::new(MockLlmClient::new(["task-b", "task-a"]).with_fallback("DONE"));
    let supervisor = Agent::new("boss", "Supervisor", "Order the work", supervisor_llm).with_id("boss");

    let llm = Arc::new(MockLlmClient::always(final_answer("result")));
    let team = Team::builder("managed")
        .agents([worker("a1", llm.clone()), worker("a2", llm)])
        .tasks([
            Task::new("first declared", "out", "a1").with_id("task-a"),
            Task::new("second declared", "out", "a2").with_id("task-b"),
        ])
        .manager(supervisor)
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    let completion = team.wait_until_settled().await;
    assert_eq!(completion.status, WorkflowStatus::Finished);

    // The supervisor ran task-b first, against declaration order
    let logs = team.workflow_logs();
    let b_doing = task_status_index(&logs, "task-b", TaskStatus::Doing).unwrap();
    let a_doing = task_status_index(&logs, "task-a", TaskStatus::Doing).unwrap();
    let b_done = task_status_index(&logs, "task-b", TaskStatus::Done).unwrap();
    assert!(b_doing < a_doing);
    assert!(b_done < a_doing, "supervisor decisions are serialized");
}

#[tokio::test]
async fn manager_saying_done_early_parks_workflow_blocked() {
    let supervisor_llm = Arc::new(MockLlmClient::always("DONE"));
    let supervisor = Agent::new("boss", "Supervisor", "Order the work", supervisor_llm).with_id("boss");

    let llm = Arc::new(MockLlmClient::always(final_answer("result")));
    let team = Team::builder("abandoned")
        .agents([worker("a1", llm.clone())])
        .tasks([Task::new("never chosen", "out", "a1").with_id("task-a")])
        .manager(supervisor)
        .build()
        .unwrap();

    team.start(None).await.unwrap();
    let completion = team.wait_until_settled().await;

    // The supervisor declared the workflow done with work still pending:
    // nothing runs, nothing finishes
    assert_eq!(completion.status, WorkflowStatus::Blocked);
    assert_eq!(team.task_status("task-a"), Some(TaskStatus::Todo));
    assert_eq!(llm.call_count(), 0, "the worker agent was never invoked");

    let logs = team.workflow_logs();
    assert!(task_status_index(&logs, "task-a", TaskStatus::Doing).is_none());
}

#[tokio::test]
async fn manager_strategy_fails_workflow_after_repeated_bad_choices() {
    let supervisor_llm = Arc::new(MockLlmClient::always("banana"));
    let supervisor = Agent::new("boss", "Supervisor", "Order the work", supervisor_llm).with_id("boss");

    let llm = Arc::new(MockLlmClient::always(final_answer("result")));
    let team = Team::builder("mismanaged")
        .agents([worker("a1", llm)])
        .tasks([Task::new("only task", "out", "a1").with_id("task-a")])
        .manager(supervisor)
        .build()
        .unwrap();

    let error = team.start(None).await.unwrap_err();
    assert!(matches!(error, WorkflowError::ManagerLoop(_)));
    assert!(error.to_string().starts_with("MANAGER_LOOP"));
    assert_eq!(team.workflow_status(), WorkflowStatus::Errored);
}

// =============================================================================
// Inputs, snapshots, stats
// =============================================================================

#[tokio::test]
async fn inputs_are_interpolated_into_task_descriptions() {
    let llm = Arc::new(MockLlmClient::new([final_answer("ok")]));
    let team = Team::builder("interpolated")
        .agents([worker("a1", llm)])
        .tasks([Task::new("Summarize {topic} in {count} bullet points", "out", "a1").with_id("t1")])
        .build()
        .unwrap();

    let mut inputs = BTreeMap::new();
    inputs.insert("topic".to_string(), json!("rust"));
    inputs.insert("count".to_string(), json!(3));
    team.start(Some(inputs)).await.unwrap();
    let completion = team.wait_until_settled().await;
    assert_eq!(completion.status, WorkflowStatus::Finished);

    let task = team.store().task("t1").unwrap();
    assert_eq!(
        task.interpolated_description.as_deref(),
        Some("Summarize rust in 3 bullet points")
    );
}

fn snapshot_team() -> Team {
    let llm = Arc::new(MockLlmClient::new([final_answer("alpha"), final_answer("beta")]).with_usage(10, 5));
    Team::builder("snapshot")
        .agents([worker("a1", llm)])
        .tasks([
            Task::new("one", "out", "a1").with_id("t1"),
            Task::new("two", "out", "a1").with_id("t2"),
        ])
        .build()
        .unwrap()
}

#[tokio::test]
async fn cleaned_state_is_deterministic_across_runs() {
    let first = snapshot_team();
    first.start(None).await.unwrap();
    assert_eq!(first.wait_until_settled().await.status, WorkflowStatus::Finished);

    let second = snapshot_team();
    second.start(None).await.unwrap();
    assert_eq!(second.wait_until_settled().await.status, WorkflowStatus::Finished);

    let snap_a = first.get_cleaned_state();
    let snap_b = second.get_cleaned_state();
    assert_eq!(snap_a, snap_b);

    // Spot-check the redaction
    assert_eq!(snap_a["tasks"][0]["id"], "[REDACTED]");
    assert_eq!(snap_a["workflow_logs"][0]["timestamp"], "[REDACTED]");
    assert_eq!(snap_a["workflow_status"], "FINISHED");
}

#[tokio::test]
async fn workflow_stats_fold_counts_calls_and_tokens() {
    let team = snapshot_team();
    team.start(None).await.unwrap();
    assert_eq!(team.wait_until_settled().await.status, WorkflowStatus::Finished);

    let stats = team.get_workflow_stats();
    assert_eq!(stats.call_count, 2);
    assert_eq!(stats.iteration_count, 2);
    assert_eq!(stats.error_count, 0);
    assert_eq!(stats.parsing_errors, 0);
    assert_eq!(stats.total_tokens, 30);

    let usage = stats.per_model_usage.get("mock-model").unwrap();
    assert_eq!(usage.calls, 2);
    assert_eq!(usage.input_tokens, 20);
    assert_eq!(usage.output_tokens, 10);
    assert!(stats.cost_details.total_cost > 0.0);
    assert!(stats.duration_ms >= 0);
}

// =============================================================================
// Tool usage through the loop
// =============================================================================

mod tool_loop {
    use super::*;
    use async_trait::async_trait;
    use teamflow::{Tool, ToolResult};

    struct AdderTool;

    #[async_trait]
    impl Tool for AdderTool {
        fn name(&self) -> &str {
            "adder"
        }

        fn description(&self) -> &str {
            "Add two numbers"
        }

        fn input_schema(&self) -> serde_json::Value {
            json!({
                "type": "object",
                "properties": {
                    "a": {"type": "number"},
                    "b": {"type": "number"}
                },
                "required": ["a", "b"]
            })
        }

        async fn invoke(&self, input: serde_json::Value) -> ToolResult {
            match (input["a"].as_f64(), input["b"].as_f64()) {
                (Some(a), Some(b)) => ToolResult::success(format!("{}", a + b)),
                _ => ToolResult::error("both 'a' and 'b' are required numbers"),
            }
        }
    }

    #[tokio::test]
    async fn agent_uses_tool_then_answers() {
        let llm = Arc::new(MockLlmClient::new([
            "{\"action\": \"adder\", \"actionInput\": {\"a\": 2, \"b\": 3}}".to_string(),
            final_answer("the sum is 5"),
        ]));
        let agent = Agent::new("calc", "Calculator", "Do arithmetic", llm)
            .with_id("calc")
            .with_tools(vec![Arc::new(AdderTool)]);

        let team = Team::builder("tooling")
            .agents([agent])
            .tasks([Task::new("add 2 and 3", "the sum", "calc").with_id("t1")])
            .build()
            .unwrap();

        team.start(None).await.unwrap();
        let completion = team.wait_until_settled().await;
        assert_eq!(completion.status, WorkflowStatus::Finished);
        assert_eq!(completion.result, Some(json!("the sum is 5")));

        let logs = team.workflow_logs();
        assert_eq!(agent_status_count(&logs, AgentStatus::UsingTool), 1);
        assert_eq!(agent_status_count(&logs, AgentStatus::UsingToolEnd), 1);
        assert_eq!(agent_status_count(&logs, AgentStatus::UsingToolError), 0);

        // The tool result reached the model as an observation turn
        let tool_end = logs
            .iter()
            .find(|l| l.agent_status() == Some(AgentStatus::UsingToolEnd))
            .unwrap();
        assert_eq!(tool_end.metadata["result"], "5");
    }

    #[tokio::test]
    async fn unknown_tool_is_recoverable() {
        let llm = Arc::new(MockLlmClient::new([
            "{\"action\": \"missing_tool\", \"actionInput\": {}}".to_string(),
            final_answer("answered without the tool"),
        ]));
        let agent = Agent::new("calc", "Calculator", "Do arithmetic", llm)
            .with_id("calc")
            .with_tools(vec![Arc::new(AdderTool)]);

        let team = Team::builder("missing-tool")
            .agents([agent])
            .tasks([Task::new("do something", "out", "calc").with_id("t1")])
            .build()
            .unwrap();

        team.start(None).await.unwrap();
        let completion = team.wait_until_settled().await;

        assert_eq!(completion.status, WorkflowStatus::Finished);
        let logs = team.workflow_logs();
        assert_eq!(agent_status_count(&logs, AgentStatus::UsingToolError), 1);
    }
}
