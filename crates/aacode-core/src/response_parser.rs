//! C6 Response Parser: extracts `(thought, actions)` from free-form model
//! output. Implements spec.md §4.6's four-strategy extraction order
//! (JSON-in-fence, bare JSON, structured text, fallback).

use std::collections::HashMap;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::{Map, Value};

use crate::types::ActionItem;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub thought: String,
    pub actions: Vec<ActionItem>,
}

pub fn parse(response: &str) -> ParsedResponse {
    if let Some(parsed) = parse_json_fence(response) {
        return parsed;
    }
    if let Some(parsed) = parse_bare_json(response) {
        return parsed;
    }
    if let Some(parsed) = parse_structured_text(response) {
        return parsed;
    }
    fallback(response)
}

fn json_fence_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| Regex::new(r"(?is)```(?:json)?\s*\n?\{").expect("static pattern"))
}

fn parse_json_fence(response: &str) -> Option<ParsedResponse> {
    let open_match = json_fence_pattern().find(response)?;
    let brace_start = open_match.end() - 1;
    let slice = &response[brace_start..];
    let end = balanced_object_end(slice)?;
    let candidate = &slice[..end];
    let repaired = repair_json(candidate);
    let value: Value = serde_json::from_str(&repaired).ok()?;
    response_from_object(value.as_object()?)
}

fn parse_bare_json(response: &str) -> Option<ParsedResponse> {
    let start = response.find('{')?;
    let slice = &response[start..];
    let end = balanced_object_end(slice)?;
    let candidate = &slice[..end];
    let repaired = repair_json(candidate);
    let value: Value = serde_json::from_str(&repaired).ok()?;
    let object = value.as_object()?;
    if !object.contains_key("thought") {
        return None;
    }
    response_from_object(object)
}

fn balanced_object_end(text: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn response_from_object(object: &Map<String, Value>) -> Option<ParsedResponse> {
    let thought = object
        .get("thought")
        .or_else(|| object.get("thinking"))
        .or_else(|| object.get("reasoning"))
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let actions = if let Some(Value::Array(items)) = object.get("actions") {
        items.iter().filter_map(action_item_from_value).collect()
    } else if let Some(action) = object.get("action").and_then(Value::as_str) {
        let input = object.get("action_input").cloned().unwrap_or(Value::Object(Map::new()));
        vec![ActionItem {
            tool_name: action.to_string(),
            params: value_to_params(input),
            observation: None,
        }]
    } else {
        Vec::new()
    };

    Some(ParsedResponse { thought, actions })
}

fn action_item_from_value(value: &Value) -> Option<ActionItem> {
    let object = value.as_object()?;
    let name = object.get("action").and_then(Value::as_str)?.to_string();
    let input = object.get("action_input").cloned().unwrap_or(Value::Object(Map::new()));
    Some(ActionItem {
        tool_name: name,
        params: value_to_params(input),
        observation: None,
    })
}

fn value_to_params(value: Value) -> HashMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        other => {
            let mut map = HashMap::new();
            map.insert("input".to_string(), other);
            map
        }
    }
}

static LABEL_PATTERN: OnceLock<Regex> = OnceLock::new();

fn label_pattern() -> &'static Regex {
    #[allow(clippy::expect_used)]
    LABEL_PATTERN.get_or_init(|| {
        Regex::new(r"(?m)^\s*(Thought|思考|Action|动作|Action Input|输入)\s*(\d+)?\s*:\s*(.*)$")
            .expect("static pattern")
    })
}

fn parse_structured_text(response: &str) -> Option<ParsedResponse> {
    let mut thought = String::new();
    let mut found_thought = false;
    let mut actions: Vec<(Option<u32>, String)> = Vec::new();
    let mut inputs: Vec<(Option<u32>, String)> = Vec::new();

    for captures in label_pattern().captures_iter(response) {
        let label = &captures[1];
        let number = captures.get(2).and_then(|m| m.as_str().parse::<u32>().ok());
        let value = captures[3].trim().to_string();
        match label {
            "Thought" | "思考" => {
                thought = value;
                found_thought = true;
            }
            "Action" | "动作" => actions.push((number, value)),
            "Action Input" | "输入" => inputs.push((number, value)),
            _ => {}
        }
    }

    if !found_thought {
        return None;
    }

    let mut action_items = Vec::with_capacity(actions.len());
    for (idx, (number, name)) in actions.into_iter().enumerate() {
        let paired_input = number
            .and_then(|n| inputs.iter().find(|(num, _)| *num == Some(n)))
            .or_else(|| inputs.get(idx))
            .map(|(_, text)| text.clone())
            .unwrap_or_default();

        let params = if paired_input.trim_start().starts_with('{') {
            match serde_json::from_str::<Value>(&repair_json(&paired_input)) {
                Ok(Value::Object(map)) => map.into_iter().collect(),
                _ => {
                    let mut map = HashMap::new();
                    map.insert("_error".to_string(), Value::String("failed to parse action input as JSON".to_string()));
                    map.insert("_raw".to_string(), Value::String(paired_input.clone()));
                    map
                }
            }
        } else {
            let mut map = HashMap::new();
            map.insert("input".to_string(), Value::String(paired_input));
            map
        };

        action_items.push(ActionItem {
            tool_name: name,
            params,
            observation: None,
        });
    }

    Some(ParsedResponse { thought, actions: action_items })
}

fn fallback(response: &str) -> ParsedResponse {
    let thought: String = response.chars().take(500).collect();
    ParsedResponse { thought, actions: Vec::new() }
}

/// Strip trailing commas and stray markdown residue before a JSON parse
/// attempt.
fn repair_json(candidate: &str) -> String {
    static TRAILING_COMMA: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    let re = TRAILING_COMMA.get_or_init(|| Regex::new(r",\s*([}\]])").expect("static pattern"));
    re.replace_all(candidate.trim(), "$1").to_string()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_json_fence() {
        let response = "```json\n{\"thought\":\"创建文件\",\"action\":\"write_file\",\"action_input\":{\"path\":\"hello.py\"}}\n```";
        let parsed = parse(response);
        assert_eq!(parsed.thought, "创建文件");
        assert_eq!(parsed.actions.len(), 1);
        assert_eq!(parsed.actions[0].tool_name, "write_file");
    }

    #[test]
    fn parses_bare_json() {
        let response = r#"here is my answer: {"thought": "thinking", "action": "read_file", "action_input": {"path": "x"}} done"#;
        let parsed = parse(response);
        assert_eq!(parsed.thought, "thinking");
        assert_eq!(parsed.actions[0].tool_name, "read_file");
    }

    #[test]
    fn parses_structured_text_with_multiple_actions() {
        let response = "Thought: let's go\nAction 1: read_file\nAction Input 1: {\"path\": \"a\"}\nAction 2: read_file\nAction Input 2: {\"path\": \"b\"}";
        let parsed = parse(response);
        assert_eq!(parsed.thought, "let's go");
        assert_eq!(parsed.actions.len(), 2);
        assert_eq!(parsed.actions[1].params.get("path"), Some(&json!("b")));
    }

    #[test]
    fn structured_text_plain_input_wraps_in_input_key() {
        let response = "Thought: go\nAction: run_shell\nAction Input: ls -la";
        let parsed = parse(response);
        assert_eq!(parsed.actions[0].params.get("input"), Some(&json!("ls -la")));
    }

    #[test]
    fn structured_text_bad_json_input_carries_error_field() {
        let response = "Thought: go\nAction: read_file\nAction Input: {not json}";
        let parsed = parse(response);
        assert!(parsed.actions[0].params.contains_key("_error"));
    }

    #[test]
    fn fallback_uses_first_500_chars_and_empty_actions() {
        let response = "just rambling with no labels at all";
        let parsed = parse(response);
        assert_eq!(parsed.thought, response);
        assert!(parsed.actions.is_empty());
    }

    #[test]
    fn empty_response_yields_empty_actions() {
        let parsed = parse("");
        assert_eq!(parsed.thought, "");
        assert!(parsed.actions.is_empty());
    }

    #[test]
    fn trailing_comma_is_repaired() {
        let response = "```json\n{\"thought\": \"x\", \"action\": \"noop\", \"action_input\": {\"a\": 1,},}\n```";
        let parsed = parse(response);
        assert_eq!(parsed.thought, "x");
    }
}
