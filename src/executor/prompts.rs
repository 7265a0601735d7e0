//! Prompt assembly for the agent iteration loop
//!
//! Prompts are plain format strings; the `{name}` placeholder syntax in
//! task descriptions is interpolated from the workflow inputs with a
//! simple scan, and unknown placeholders are left literal so a typo shows
//! up verbatim in the prompt rather than vanishing.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::warn;

use crate::domain::{Agent, Task};

/// Interpolate `{name}` slots in a template from the workflow inputs
///
/// Placeholders with no matching input are left literal and logged.
pub fn interpolate_inputs(template: &str, inputs: &BTreeMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let key = &after[..close];
                if !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_') {
                    match inputs.get(key) {
                        Some(value) => out.push_str(&value_text(value)),
                        None => {
                            warn!(placeholder = key, "no input value for placeholder; leaving literal");
                            out.push('{');
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                    rest = &after[close + 1..];
                } else {
                    out.push('{');
                    rest = after;
                }
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// System prompt: agent identity, tool catalog, and the output contract
pub fn system_prompt(agent: &Agent) -> String {
    let mut prompt = format!("You are {}, a {}.\nYour goal: {}", agent.name, agent.role, agent.goal);
    if !agent.background.is_empty() {
        prompt.push_str(&format!("\nBackground: {}", agent.background));
    }

    if agent.tools.is_empty() {
        prompt.push_str("\n\nYou have no tools available. Work from the task description and prior results alone.");
    } else {
        prompt.push_str("\n\nAvailable tools:");
        for tool in &agent.tools {
            prompt.push_str(&format!(
                "\n- {}: {}\n  Input schema: {}",
                tool.name(),
                tool.description(),
                tool.input_schema()
            ));
        }
    }

    prompt.push_str(
        "\n\nRespond with exactly one JSON object per turn, using one of these shapes:\n\
         {\"finalAnswer\": <your complete answer>} when the task is done\n\
         {\"action\": \"<tool name>\", \"actionInput\": {...}} to use a tool\n\
         {\"selfQuestion\": \"<question>\"} to ask yourself a clarifying question\n\
         {\"observation\": \"<note>\"} to record an intermediate observation",
    );
    prompt
}

/// First user turn: the task itself plus aggregated context and feedback
pub fn task_prompt(task: &Task, context: &str, feedback: &[String]) -> String {
    let mut prompt = format!(
        "Your task: {}\nExpected output: {}",
        task.effective_description(),
        task.expected_output
    );

    if !context.is_empty() {
        prompt.push_str(&format!("\n\nResults from earlier tasks:\n{}", context));
    }

    if !feedback.is_empty() {
        prompt.push_str(&format!("\n\n{}", feedback_prompt(feedback)));
    }

    prompt
}

/// Feedback block injected when a task is re-run after human review
pub fn feedback_prompt(feedback: &[String]) -> String {
    let mut prompt =
        String::from("Your previous result received human feedback. Address every point and produce a revised result:");
    for entry in feedback {
        prompt.push_str(&format!("\n- {}", entry));
    }
    prompt
}

/// Nudge issued when the iteration budget is nearly exhausted
pub fn force_final_nudge() -> String {
    "You are almost out of iterations. Respond now with {\"finalAnswer\": ...} containing your best \
     complete answer. Do not use tools or ask further questions."
        .to_string()
}

/// Nudge appended after an unparseable reply
pub fn corrective_nudge() -> String {
    "Your last reply could not be parsed. Respond with exactly one JSON object: \
     {\"finalAnswer\": ...}, {\"action\": \"<tool>\", \"actionInput\": {...}}, \
     {\"selfQuestion\": \"...\"}, or {\"observation\": \"...\"}."
        .to_string()
}
