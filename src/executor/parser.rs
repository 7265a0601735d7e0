//! LLM output parsing
//!
//! Models are asked to answer with a single JSON object, but real output
//! arrives wrapped in markdown fences, prefixed with prose, or with
//! snake_case key spellings. The parser tries progressively looser
//! extractions before giving up; an unparseable reply is recoverable (the
//! loop appends a corrective nudge and continues).

use serde_json::Value;
use thiserror::Error;

/// Classified shape of one LLM reply
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedOutput {
    /// The task is done; the payload becomes the task result
    FinalAnswer(Value),
    /// Invoke a tool with the given input
    ToolAction { tool: String, input: Value },
    /// The agent asked itself a question to keep reasoning
    SelfQuestion(String),
    /// Intermediate observation or thought, nothing to execute
    Observation(String),
}

/// Why a reply could not be classified
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("no JSON object found in output")]
    NoJson,

    #[error("JSON object does not match any known shape")]
    UnrecognizedShape,
}

/// Parse a raw LLM reply into one of the known shapes
pub fn parse_llm_output(raw: &str) -> Result<ParsedOutput, ParseError> {
    let mut saw_object = false;

    for candidate in candidates(raw) {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&candidate) {
            saw_object = true;
            if let Some(parsed) = classify(&map) {
                return Ok(parsed);
            }
        }
    }

    Err(if saw_object {
        ParseError::UnrecognizedShape
    } else {
        ParseError::NoJson
    })
}

/// Candidate JSON strings in decreasing order of strictness
fn candidates(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    let trimmed = raw.trim();
    out.push(trimmed.to_string());

    if let Some(fenced) = extract_fenced(trimmed) {
        out.push(fenced);
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        out.push(trimmed[start..=end].to_string());
    }

    out
}

/// Content of the first ``` fence, with an optional language tag stripped
fn extract_fenced(text: &str) -> Option<String> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let close = after_open.find("```")?;
    let mut content = &after_open[..close];
    if let Some(rest) = content.strip_prefix("json") {
        content = rest;
    }
    Some(content.trim().to_string())
}

fn classify(map: &serde_json::Map<String, Value>) -> Option<ParsedOutput> {
    if let Some(answer) = get_either(map, "finalAnswer", "final_answer") {
        return Some(ParsedOutput::FinalAnswer(answer.clone()));
    }

    if let Some(Value::String(tool)) = map.get("action") {
        let input = get_either(map, "actionInput", "action_input")
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));
        return Some(ParsedOutput::ToolAction {
            tool: tool.clone(),
            input,
        });
    }

    if let Some(Value::String(question)) = get_either(map, "selfQuestion", "self_question") {
        return Some(ParsedOutput::SelfQuestion(question.clone()));
    }

    if let Some(Value::String(observation)) = map.get("observation") {
        return Some(ParsedOutput::Observation(observation.clone()));
    }

    if let Some(Value::String(thought)) = map.get("thought") {
        return Some(ParsedOutput::Observation(thought.clone()));
    }

    None
}

fn get_either<'a>(map: &'a serde_json::Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    map.get(camel).or_else(|| map.get(snake))
}
