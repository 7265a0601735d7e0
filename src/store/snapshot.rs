//! Cleaned state snapshots
//!
//! Produces a redacted, time-independent view of the team state so two
//! runs with identical (mocked) LLM responses serialize to identical
//! JSON. Every generated id, secret, and wall-clock field is replaced
//! with a sentinel.

use serde_json::{Value, json};

use super::team_store::TeamState;

/// Sentinel substituted for redacted values
pub const REDACTED: &str = "[REDACTED]";

/// Keys whose values are non-deterministic across runs or secret
const REDACT_KEYS: &[&str] = &[
    "id",
    "agent_id",
    "task_id",
    "executing_agent_id",
    "env",
    "api_key",
    "timestamp",
    "duration",
    "duration_ms",
    "start_time",
    "end_time",
];

/// Build the redacted snapshot of a team state
pub fn cleaned_state(state: &TeamState) -> Value {
    let mut value = json!({
        "name": state.name,
        "workflow_status": state.workflow_status,
        "workflow_result": state.workflow_result,
        "agents": serde_json::to_value(&state.agents).unwrap_or(Value::Null),
        "tasks": serde_json::to_value(&state.tasks).unwrap_or(Value::Null),
        "workflow_logs": serde_json::to_value(&state.workflow_logs).unwrap_or(Value::Null),
        "inputs": serde_json::to_value(&state.inputs).unwrap_or(Value::Null),
        "workflow_context": serde_json::to_value(&state.workflow_memory).unwrap_or(Value::Null),
    });
    redact(&mut value);
    value
}

fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if REDACT_KEYS.contains(&key.as_str()) {
                    *entry = Value::String(REDACTED.to_string());
                } else {
                    redact(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact(item);
            }
        }
        _ => {}
    }
}
