//! Parsing the Plan agent's JSON output into `Task`s (Plan
//! phase, §9 design note on dynamic JSON parsing).
//!
//! Generalizes the `executor::parser::ResponseParser::extract_json`
//! (code-block / raw-brace extraction) into the richer envelope-unwrapping
//! and a balanced-bracket fallback for envelopes that hide it.

use std::collections::HashSet;

use serde_json::Value;
use tracing::warn;

use crate::error::{OrchestratorError, Result};

const SHELL_LIKE_NAMES: &[&str] = &[
    "bash", "sh", "zsh", "fish", "powershell", "pwsh", "terminal", "shell", "command", "cli",
    "default", "auto",
];

/// One plan item as parsed from JSON, before agent-name resolution.
#[derive(Debug, Clone)]
pub struct ParsedPlanItem {
    pub id: String,
    pub name: String,
    pub description: String,
    pub agent: String,
    pub depends_on: Vec<String>,
}

/// Try, in order: top-level array; `{"tasks": [...]}` wrapper; provider
/// envelope (`candidates[].content.parts[].text`, or any string-valued leaf
/// that itself parses as JSON); balanced-bracket extraction from raw text.
/// Empty output or an unparseable response is an error.
pub fn parse_plan(raw: &str) -> Result<Vec<ParsedPlanItem>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(OrchestratorError::Validation("empty plan output".into()));
    }

    let value = extract_plan_value(trimmed)
        .ok_or_else(|| OrchestratorError::Validation("no JSON plan found in agent output".into()))?;

    let items = items_from_value(&value)?;
    if items.is_empty() {
        return Err(OrchestratorError::Validation("plan contains no tasks".into()));
    }

    let mut seen = HashSet::new();
    for item in &items {
        if !seen.insert(item.id.clone()) {
            return Err(OrchestratorError::Validation(format!(
                "duplicate plan item id '{}'",
                item.id
            )));
        }
    }

    Ok(items)
}

/// Resolve an agent for a plan item: trim; empty or
/// shell-like name falls back to the default agent; otherwise
/// case-insensitive match against the registry; else default with warning.
pub fn resolve_agent(declared: &str, valid_agents: &[String], default_agent: &str) -> String {
    let trimmed = declared.trim();

    if trimmed.is_empty() || SHELL_LIKE_NAMES.contains(&trimmed.to_lowercase().as_str()) {
        return default_agent.to_string();
    }

    if let Some(found) = valid_agents
        .iter()
        .find(|candidate| candidate.eq_ignore_ascii_case(trimmed))
    {
        return found.clone();
    }

    warn!(declared = trimmed, default_agent, "unknown agent in plan item, falling back to default");
    default_agent.to_string()
}

fn extract_plan_value(text: &str) -> Option<Value> {
    // 1. Try the whole trimmed text as JSON directly.
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        if let Some(unwrapped) = unwrap_envelope(&value) {
            return Some(unwrapped);
        }
    }

    // 2. Try a ```json fenced block.
    if let Some(fenced) = extract_fenced_json(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&fenced) {
            if let Some(unwrapped) = unwrap_envelope(&value) {
                return Some(unwrapped);
            }
        }
    }

    // 3. Balanced-bracket extraction fallback: scan for the first balanced
    // `{...}` or `[...]` region and parse that.
    extract_balanced_json(text).and_then(|candidate| {
        serde_json::from_str::<Value>(&candidate)
            .ok()
            .and_then(|value| unwrap_envelope(&value))
    })
}

fn extract_fenced_json(text: &str) -> Option<String> {
    for marker in ["```json", "```JSON"] {
        if let Some(start) = text.find(marker) {
            let content = &text[start + marker.len()..];
            if let Some(end) = content.find("```") {
                return Some(content[..end].trim().to_string());
            }
        }
    }
    None
}

/// Scan `text` for the first balanced bracket region (either `{...}` or
/// `[...]`, whichever opens first) and return its raw source.
fn extract_balanced_json(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|b| *b == b'{' || *b == b'[')?;
    let open = bytes[start];
    let close = if open == b'{' { b'}' } else { b']' };

    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escape {
                escape = false;
            } else if byte == b'\\' {
                escape = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }

        match byte {
            b'"' => in_string = true,
            b if b == open => depth += 1,
            b if b == close => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return Some(text[start..end].to_string());
                }
            }
            _ => {}
        }
    }

    None
}

/// Recursively unwrap provider envelopes: a top-level array or `{"tasks":
/// [...]}` wrapper is returned as-is; a `candidates[].content.parts[].text`
/// shape (or any nested string leaf that itself parses as JSON) is
/// unwrapped and re-examined.
fn unwrap_envelope(value: &Value) -> Option<Value> {
    match value {
        Value::Array(_) => Some(value.clone()),
        Value::Object(map) => {
            if let Some(tasks) = map.get("tasks") {
                if tasks.is_array() {
                    return Some(tasks.clone());
                }
            }

            if let Some(candidates) = map.get("candidates").and_then(Value::as_array) {
                for candidate in candidates {
                    if let Some(text) = candidate
                        .get("content")
                        .and_then(|c| c.get("parts"))
                        .and_then(Value::as_array)
                        .and_then(|parts| parts.first())
                        .and_then(|part| part.get("text"))
                        .and_then(Value::as_str)
                    {
                        if let Ok(inner) = serde_json::from_str::<Value>(text) {
                            if let Some(unwrapped) = unwrap_envelope(&inner) {
                                return Some(unwrapped);
                            }
                        }
                        if let Some(extracted) = extract_balanced_json(text) {
                            if let Ok(inner) = serde_json::from_str::<Value>(&extracted) {
                                if let Some(unwrapped) = unwrap_envelope(&inner) {
                                    return Some(unwrapped);
                                }
                            }
                        }
                    }
                }
            }

            // Last resort: any string field that itself parses as a JSON
            // plan (covers arbitrary provider wrappers not named above).
            for field in map.values() {
                if let Some(text) = field.as_str() {
                    if let Ok(inner) = serde_json::from_str::<Value>(text) {
                        if let Some(unwrapped) = unwrap_envelope(&inner) {
                            return Some(unwrapped);
                        }
                    }
                }
            }

            None
        }
        _ => None,
    }
}

fn items_from_value(value: &Value) -> Result<Vec<ParsedPlanItem>> {
    let array = value
        .as_array()
        .ok_or_else(|| OrchestratorError::Validation("plan JSON is not an array".into()))?;

    array
        .iter()
        .map(|item| {
            let id = item
                .get("id")
                .and_then(Value::as_str)
                .ok_or_else(|| OrchestratorError::Validation("plan item missing 'id'".into()))?
                .to_string();
            let name = item
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(&id)
                .to_string();
            let description = item
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let agent = item
                .get("agent")
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            let depends_on = item
                .get("depends_on")
                .and_then(Value::as_array)
                .map(|deps| {
                    deps.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            Ok(ParsedPlanItem {
                id,
                name,
                description,
                agent,
                depends_on,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_top_level_array() {
        let items = parse_plan(r#"[{"id":"t1","name":"one","agent":"claude","depends_on":[]}]"#).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "t1");
    }

    #[test]
    fn parses_tasks_wrapper_same_as_top_level_array() {
        let array = parse_plan(r#"[{"id":"t1","name":"one","agent":"claude","depends_on":[]}]"#).unwrap();
        let wrapped =
            parse_plan(r#"{"tasks":[{"id":"t1","name":"one","agent":"claude","depends_on":[]}]}"#).unwrap();
        assert_eq!(array.len(), wrapped.len());
        assert_eq!(array[0].id, wrapped[0].id);
    }

    #[test]
    fn empty_output_is_error() {
        assert!(parse_plan("").is_err());
        assert!(parse_plan("   ").is_err());
    }

    #[test]
    fn empty_array_is_error() {
        assert!(parse_plan("[]").is_err());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = parse_plan(
            r#"[{"id":"t1","name":"one","agent":"a"},{"id":"t1","name":"two","agent":"a"}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
    }

    #[test]
    fn extracts_fenced_json_block() {
        let text = "Here is the plan:\n```json\n[{\"id\":\"t1\",\"name\":\"one\",\"agent\":\"a\"}]\n```\nThanks.";
        let items = parse_plan(text).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn unwraps_gemini_style_candidate_envelope() {
        let text = r#"{"candidates":[{"content":{"parts":[{"text":"[{\"id\":\"t1\",\"name\":\"one\",\"agent\":\"a\"}]"}]}}]}"#;
        let items = parse_plan(text).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "t1");
    }

    #[test]
    fn falls_back_to_balanced_bracket_extraction() {
        let text = "I'll produce this plan: [{\"id\":\"t1\",\"name\":\"one\",\"agent\":\"a\"}] — done.";
        let items = parse_plan(text).unwrap();
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn resolve_agent_empty_falls_back_to_default() {
        let agents = vec!["claude".to_string(), "gemini".to_string()];
        assert_eq!(resolve_agent("", &agents, "claude"), "claude");
        assert_eq!(resolve_agent("   ", &agents, "claude"), "claude");
    }

    #[test]
    fn resolve_agent_shell_like_falls_back_to_default() {
        let agents = vec!["claude".to_string()];
        assert_eq!(resolve_agent("bash", &agents, "claude"), "claude");
        assert_eq!(resolve_agent("auto", &agents, "claude"), "claude");
    }

    #[test]
    fn resolve_agent_matches_case_insensitively() {
        let agents = vec!["Claude".to_string(), "Gemini".to_string()];
        assert_eq!(resolve_agent("gemini", &agents, "Claude"), "Gemini");
    }

    #[test]
    fn resolve_agent_unknown_falls_back_with_warning() {
        let agents = vec!["claude".to_string()];
        assert_eq!(resolve_agent("nonexistent", &agents, "claude"), "claude");
    }
}
