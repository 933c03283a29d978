//! The core data model: messages, sessions, steps, tool schemas, and
//! archive entries (spec.md §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::approximate_token_count;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One turn in a Session's conversation. Token count is computed once at
/// insertion (spec.md §3) so that Session-level totals never re-scan text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        let content = content.into();
        let token_count = approximate_token_count(&content);
        Self {
            role,
            content,
            timestamp: Utc::now(),
            token_count,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
    Archived,
}

/// A persistent, token-bounded conversation context for one ongoing task.
///
/// Invariants (spec.md §3): a system message always occupies index 0; the
/// cached `total_tokens` never exceeds `max_tokens` except transiently
/// during insertion; `id` is unique within the owning store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub title: String,
    pub status: SessionStatus,
    pub messages: Vec<Message>,
    pub total_tokens: usize,
}

impl Session {
    pub fn total_tokens_recomputed(&self) -> usize {
        self.messages.iter().map(|m| m.token_count).sum()
    }
}

/// A single tool invocation requested by the model, with its parameters and
/// (after execution) its observation text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionItem {
    pub tool_name: String,
    pub params: HashMap<String, Value>,
    pub observation: Option<String>,
}

/// One full ReAct iteration: a thought, zero or more actions, a timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub thought: String,
    pub actions: Vec<ActionItem>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ParamType::String => "string",
            ParamType::Integer => "integer",
            ParamType::Number => "number",
            ParamType::Boolean => "boolean",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }
}

/// One declared parameter of a tool, including the alternative names
/// (spec.md §3's "alias list") the model may use instead of the canonical
/// name. Every alias must map unambiguously to one canonical parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub param_type: ParamType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: String,
    pub example: Option<Value>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl Parameter {
    pub fn new(name: impl Into<String>, param_type: ParamType, required: bool) -> Self {
        Self {
            name: name.into(),
            param_type,
            required,
            default: None,
            description: String::new(),
            example: None,
            aliases: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_aliases(mut self, aliases: impl IntoIterator<Item = &'static str>) -> Self {
        self.aliases = aliases.into_iter().map(str::to_string).collect();
        self
    }

    pub fn with_example(mut self, example: Value) -> Self {
        self.example = Some(example);
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// The declared shape of one tool: its name, description, and parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Vec<Parameter>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<Parameter>) -> Self {
        self.parameters = parameters;
        self
    }
}

/// The origin kind an archived payload was captured from; encoded into the
/// archive file's name (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveKind {
    FileContent,
    ShellOutput,
    SearchResults,
    FileList,
    CodeOutput,
}

impl ArchiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveKind::FileContent => "file_content",
            ArchiveKind::ShellOutput => "shell_output",
            ArchiveKind::SearchResults => "search_results",
            ArchiveKind::FileList => "file_list",
            ArchiveKind::CodeOutput => "code_output",
        }
    }

    /// Human-readable label used in compaction citations.
    pub fn display_name(&self) -> &'static str {
        match self {
            ArchiveKind::FileContent => "file content",
            ArchiveKind::ShellOutput => "shell output",
            ArchiveKind::SearchResults => "search results",
            ArchiveKind::FileList => "file list",
            ArchiveKind::CodeOutput => "code output",
        }
    }
}

/// Priority used for Todo Manager items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn glyph(&self) -> &'static str {
        match self {
            Priority::High => "\u{1f534}",
            Priority::Medium => "\u{1f7e1}",
            Priority::Low => "\u{1f7e2}",
        }
    }
}

/// The result a tool function returns. Contracted by spec.md §6: "either a
/// string or a map with at least `success: bool`".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returncode: Option<i32>,
}

impl ToolOutput {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
            error: None,
            stdout: None,
            stderr: None,
            returncode: None,
        }
    }

    pub fn err(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            content: error.clone(),
            error: Some(error),
            stdout: None,
            stderr: None,
            returncode: None,
        }
    }
}
