//! Workflow statistics
//!
//! Stats are a pure fold over the workflow log, scoped to the stretch
//! since the latest RUNNING transition. Recomputing on demand keeps the
//! numbers consistent under revision ripples; nothing is cached.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::domain::{AgentStatus, WorkflowLog, WorkflowLogKind, WorkflowStatus};
use crate::llm::{TokenUsage, usage_cost_usd};

/// Per-model token usage accumulated from THINKING_END records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub calls: u64,
}

/// Aggregate cost breakdown in USD
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CostDetails {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

/// Aggregated statistics for the latest workflow run
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkflowStats {
    /// Milliseconds between the latest RUNNING transition and the last log
    pub duration_ms: i64,
    pub per_model_usage: BTreeMap<String, ModelUsage>,
    pub total_tokens: u64,
    /// Completed LLM calls (THINKING_END records)
    pub call_count: u64,
    /// Failed LLM calls (THINKING_ERROR records)
    pub error_count: u64,
    /// Unparseable LLM outputs (ISSUES_PARSING_LLM_OUTPUT records)
    pub parsing_errors: u64,
    /// Completed loop iterations (ITERATION_END records)
    pub iteration_count: u64,
    pub cost_details: CostDetails,
}

/// Fold the logs since the latest RUNNING entry into usage statistics
pub fn compute_workflow_stats(logs: &[WorkflowLog]) -> WorkflowStats {
    let start_idx = logs
        .iter()
        .rposition(|log| {
            log.kind == WorkflowLogKind::WorkflowStatusUpdate && log.workflow_status == Some(WorkflowStatus::Running)
        })
        .unwrap_or(0);
    let window = &logs[start_idx..];

    let mut stats = WorkflowStats::default();
    if let (Some(first), Some(last)) = (window.first(), window.last()) {
        stats.duration_ms = (last.timestamp - first.timestamp).num_milliseconds();
    }

    for log in window {
        match log.agent_status() {
            Some(AgentStatus::ThinkingEnd) => {
                stats.call_count += 1;
                let model = log.metadata["model"].as_str().unwrap_or("unknown").to_string();
                let input = log.metadata["input_tokens"].as_u64().unwrap_or(0);
                let output = log.metadata["output_tokens"].as_u64().unwrap_or(0);
                let entry = stats.per_model_usage.entry(model).or_default();
                entry.input_tokens += input;
                entry.output_tokens += output;
                entry.calls += 1;
                stats.total_tokens += input + output;
            }
            Some(AgentStatus::ThinkingError) => stats.error_count += 1,
            Some(AgentStatus::IssuesParsingLlmOutput) => stats.parsing_errors += 1,
            Some(AgentStatus::IterationEnd) => stats.iteration_count += 1,
            _ => {}
        }
    }

    for (model, usage) in &stats.per_model_usage {
        let input_usage = TokenUsage::new(usage.input_tokens, 0);
        let output_usage = TokenUsage::new(0, usage.output_tokens);
        stats.cost_details.input_cost += usage_cost_usd(model, &input_usage);
        stats.cost_details.output_cost += usage_cost_usd(model, &output_usage);
    }
    stats.cost_details.total_cost = stats.cost_details.input_cost + stats.cost_details.output_cost;

    stats
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::domain::{Agent, Task};
    use crate::llm::mock::MockLlmClient;

    fn agent() -> Agent {
        let mut agent = Agent::new("worker", "Worker", "Do work", Arc::new(MockLlmClient::empty()));
        agent.status = AgentStatus::ThinkingEnd;
        agent
    }

    fn thinking_end_log(model: &str, input: u64, output: u64) -> WorkflowLog {
        WorkflowLog::agent(
            &agent(),
            None,
            "thinking done",
            json!({ "model": model, "input_tokens": input, "output_tokens": output }),
        )
    }

    #[test]
    fn test_stats_fold_counts_and_usage() {
        let task = Task::new("d", "o", "a");
        let mut iteration_agent = agent();
        iteration_agent.status = AgentStatus::IterationEnd;
        let mut parse_agent = agent();
        parse_agent.status = AgentStatus::IssuesParsingLlmOutput;

        let logs = vec![
            WorkflowLog::workflow(WorkflowStatus::Running, "started", json!({})),
            thinking_end_log("gpt-4o", 100, 50),
            WorkflowLog::agent(&parse_agent, Some(&task), "bad output", json!({})),
            WorkflowLog::agent(&iteration_agent, Some(&task), "iteration done", json!({})),
            thinking_end_log("gpt-4o", 200, 100),
            thinking_end_log("mock-model", 10, 5),
        ];

        let stats = compute_workflow_stats(&logs);
        assert_eq!(stats.call_count, 3);
        assert_eq!(stats.parsing_errors, 1);
        assert_eq!(stats.iteration_count, 1);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.total_tokens, 465);

        let gpt = stats.per_model_usage.get("gpt-4o").unwrap();
        assert_eq!(gpt.input_tokens, 300);
        assert_eq!(gpt.output_tokens, 150);
        assert_eq!(gpt.calls, 2);
        assert!(stats.cost_details.total_cost > 0.0);
    }

    #[test]
    fn test_stats_fold_scoped_to_latest_run() {
        let logs = vec![
            WorkflowLog::workflow(WorkflowStatus::Running, "first run", json!({})),
            thinking_end_log("gpt-4o", 1000, 1000),
            WorkflowLog::workflow(WorkflowStatus::Finished, "finished", json!({})),
            WorkflowLog::workflow(WorkflowStatus::Running, "second run", json!({})),
            thinking_end_log("gpt-4o", 10, 10),
        ];

        let stats = compute_workflow_stats(&logs);
        assert_eq!(stats.call_count, 1);
        assert_eq!(stats.total_tokens, 20);
    }

    #[test]
    fn test_stats_empty_logs() {
        let stats = compute_workflow_stats(&[]);
        assert_eq!(stats.call_count, 0);
        assert_eq!(stats.duration_ms, 0);
        assert!(stats.per_model_usage.is_empty());
    }
}
