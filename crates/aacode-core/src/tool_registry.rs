//! C2 Tool Registry: schema-validates tool calls, normalizes parameter
//! aliases, and suggests similar names on unknown calls. Grounded on
//! `original_source/utils/tool_registry.py`'s `ToolSchema`/`ToolRegistry`
//! pair, restated with Rust's async tool-function signature (spec.md §6).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::types::{Parameter, ToolOutput, ToolSchema};
use crate::util::closest_matches;

pub type ToolFn = Arc<
    dyn Fn(HashMap<String, Value>) -> Pin<Box<dyn Future<Output = ToolOutput> + Send>> + Send + Sync,
>;

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub error_message: Option<String>,
    pub unknown_param_warning: Option<String>,
    pub normalized: HashMap<String, Value>,
}

struct Entry {
    func: ToolFn,
    schema: ToolSchema,
}

/// Populated once at startup and thereafter read-only (spec.md §9 "Global
/// state"); tool bodies must not mutate it.
#[derive(Default)]
pub struct ToolRegistry {
    entries: HashMap<String, Entry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent; registering an existing name overwrites its schema and
    /// function.
    pub fn register(&mut self, schema: ToolSchema, func: ToolFn) {
        self.entries.insert(schema.name.clone(), Entry { func, schema });
    }

    pub fn get_schema(&self, name: &str) -> Option<&ToolSchema> {
        self.entries.get(name).map(|e| &e.schema)
    }

    pub fn get_tool(&self, name: &str) -> Option<ToolFn> {
        self.entries.get(name).map(|e| e.func.clone())
    }

    pub fn list_tools(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn alias_map(schema: &ToolSchema) -> HashMap<&str, &str> {
        let mut map = HashMap::new();
        for param in &schema.parameters {
            map.insert(param.name.as_str(), param.name.as_str());
            for alias in &param.aliases {
                map.insert(alias.as_str(), param.name.as_str());
            }
        }
        map
    }

    /// Pure renaming via the alias map; does not validate. Unmapped keys
    /// pass through unchanged.
    pub fn normalize_params(&self, name: &str, params: &HashMap<String, Value>) -> HashMap<String, Value> {
        let Some(schema) = self.get_schema(name) else {
            return params.clone();
        };
        let alias_map = Self::alias_map(schema);
        params
            .iter()
            .map(|(key, value)| {
                let canonical = alias_map.get(key.as_str()).copied().unwrap_or(key.as_str());
                (canonical.to_string(), value.clone())
            })
            .collect()
    }

    /// Validation order matches `original_source/utils/tool_registry.py`:
    /// rename through the alias map (including pass-through for unknown
    /// keys) before checking required parameters or types.
    pub fn validate_call(&self, name: &str, params: &HashMap<String, Value>) -> ValidationResult {
        let Some(schema) = self.get_schema(name) else {
            let suggestions = self.suggest_similar_tools(name, 3);
            return ValidationResult {
                valid: false,
                error_message: Some(self.format_tool_not_found_error(name, &suggestions)),
                unknown_param_warning: None,
                normalized: HashMap::new(),
            };
        };

        let alias_map = Self::alias_map(schema);
        let mut normalized = HashMap::new();
        let mut unknown_keys = Vec::new();
        for (key, value) in params {
            match alias_map.get(key.as_str()) {
                Some(canonical) => {
                    normalized.insert((*canonical).to_string(), value.clone());
                }
                None => {
                    unknown_keys.push(key.clone());
                    normalized.insert(key.clone(), value.clone());
                }
            }
        }

        let mut missing: Vec<&Parameter> = Vec::new();
        for param in &schema.parameters {
            if param.required && !normalized.contains_key(&param.name) && param.default.is_none() {
                missing.push(param);
            }
        }
        if !missing.is_empty() {
            return ValidationResult {
                valid: false,
                error_message: Some(format_missing_params_error(&missing)),
                unknown_param_warning: None,
                normalized,
            };
        }

        let mut type_errors = Vec::new();
        for param in &schema.parameters {
            if let Some(value) = normalized.get(&param.name) {
                if !value.is_null() && !param.param_type.matches(value) {
                    type_errors.push(format!(
                        "参数 '{}' 期望类型为 {}，实际类型为 {}",
                        param.name,
                        param.param_type.name(),
                        json_type_name(value)
                    ));
                }
            }
        }
        if !type_errors.is_empty() {
            return ValidationResult {
                valid: false,
                error_message: Some(type_errors.join("\n")),
                unknown_param_warning: None,
                normalized,
            };
        }

        let unknown_param_warning = if unknown_keys.is_empty() {
            None
        } else {
            let all_names: Vec<&str> = schema
                .parameters
                .iter()
                .flat_map(|p| std::iter::once(p.name.as_str()).chain(p.aliases.iter().map(String::as_str)))
                .collect();
            let suggestions: Vec<String> = unknown_keys
                .iter()
                .filter_map(|key| {
                    closest_matches(key, all_names.iter().copied(), 1, 0.6)
                        .first()
                        .map(|m| format!("{key} -> {m}"))
                })
                .collect();
            Some(if suggestions.is_empty() {
                format!("未知参数: {}", unknown_keys.join(", "))
            } else {
                format!("未知参数: {}\n建议: {}", unknown_keys.join(", "), suggestions.join(", "))
            })
        };

        ValidationResult {
            valid: true,
            error_message: None,
            unknown_param_warning,
            normalized,
        }
    }

    pub fn get_documentation(&self, name: &str) -> String {
        match self.get_schema(name) {
            Some(schema) => render_documentation(schema),
            None => format!("工具 '{name}' 不存在"),
        }
    }

    pub fn suggest_similar_tools(&self, name: &str, max_suggestions: usize) -> Vec<String> {
        let pool = self.list_tools();
        closest_matches(name, pool, max_suggestions, 0.6)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Matches spec.md §6's literal wire format.
    pub fn format_tool_not_found_error(&self, name: &str, suggestions: &[String]) -> String {
        let mut msg = format!("错误：未知工具 '{name}'\n\n");
        if !suggestions.is_empty() {
            msg.push_str("你是否想使用以下工具？\n");
            for s in suggestions {
                msg.push_str(&format!("  - {s}\n"));
            }
            msg.push('\n');
        }
        msg.push_str("可用工具列表：\n");
        for tool in self.list_tools() {
            let Some(schema) = self.get_schema(tool) else { continue };
            let desc: String = schema.description.chars().take(60).collect();
            msg.push_str(&format!("  - {tool}: {desc}...\n"));
        }
        msg
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn format_missing_params_error(missing: &[&Parameter]) -> String {
    let mut msg = format!(
        "❌ 缺少必需参数: {}\n\n📋 参数说明:\n",
        missing.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(", ")
    );
    for param in missing {
        let aliases = if param.aliases.is_empty() {
            String::new()
        } else {
            format!(" (别名: {})", param.aliases.join(", "))
        };
        msg.push_str(&format!(
            "  • {}{} ({})\n    {}\n",
            param.name,
            aliases,
            param.param_type.name(),
            param.description
        ));
        if let Some(example) = &param.example {
            msg.push_str(&format!("    💡 示例: {example}\n"));
        }
    }
    msg
}

fn render_documentation(schema: &ToolSchema) -> String {
    let mut doc = format!("## {}\n\n{}\n\n", schema.name, schema.description);
    if !schema.parameters.is_empty() {
        doc.push_str("### 参数\n\n");
        for param in &schema.parameters {
            let required_str = if param.required { "必需" } else { "可选" };
            let default_str = param
                .default
                .as_ref()
                .map(|d| format!("，默认值: {d}"))
                .unwrap_or_default();
            let aliases_str = if param.aliases.is_empty() {
                String::new()
            } else {
                format!(" (别名: {})", param.aliases.join(", "))
            };
            doc.push_str(&format!(
                "- **{}**{} ({}, {}{})\n  {}\n",
                param.name,
                aliases_str,
                param.param_type.name(),
                required_str,
                default_str,
                param.description
            ));
            if let Some(example) = &param.example {
                doc.push_str(&format!("  示例: `{example}`\n"));
            }
            doc.push('\n');
        }
    }
    doc
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::types::ParamType;
    use serde_json::json;

    fn make_registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        let schema = ToolSchema::new("read_file", "Read a file's contents").with_parameters(vec![
            Parameter::new("path", ParamType::String, true)
                .with_description("file path")
                .with_aliases(["filepath", "file_path"])
                .with_example(json!("README.md")),
        ]);
        registry.register(
            schema,
            Arc::new(|_params| Box::pin(async { ToolOutput::ok("contents") })),
        );
        registry
    }

    #[test]
    fn validate_call_renames_alias() {
        let registry = make_registry();
        let mut params = HashMap::new();
        params.insert("filepath".to_string(), json!("README.md"));
        let result = registry.validate_call("read_file", &params);
        assert!(result.valid);
        assert_eq!(result.normalized.get("path"), Some(&json!("README.md")));
    }

    #[test]
    fn validate_call_reports_missing_required() {
        let registry = make_registry();
        let result = registry.validate_call("read_file", &HashMap::new());
        assert!(!result.valid);
        assert!(result.error_message.unwrap().contains("path"));
    }

    #[test]
    fn validate_call_type_mismatch_fails() {
        let registry = make_registry();
        let mut params = HashMap::new();
        params.insert("path".to_string(), json!(42));
        let result = registry.validate_call("read_file", &params);
        assert!(!result.valid);
    }

    #[test]
    fn validate_call_unknown_key_is_warning_not_failure() {
        let registry = make_registry();
        let mut params = HashMap::new();
        params.insert("path".to_string(), json!("README.md"));
        params.insert("pth".to_string(), json!("typo"));
        let result = registry.validate_call("read_file", &params);
        assert!(result.valid);
        assert!(result.unknown_param_warning.is_some());
        assert!(result.normalized.contains_key("pth"));
    }

    #[test]
    fn unknown_tool_reports_suggestions() {
        let registry = make_registry();
        let result = registry.validate_call("read_fiel", &HashMap::new());
        assert!(!result.valid);
        assert!(result.error_message.unwrap().contains("read_file"));
    }

    #[test]
    fn normalize_params_is_idempotent() {
        let registry = make_registry();
        let mut params = HashMap::new();
        params.insert("filepath".to_string(), json!("x"));
        let once = registry.normalize_params("read_file", &params);
        let twice = registry.normalize_params("read_file", &once);
        assert_eq!(once, twice);
    }
}
