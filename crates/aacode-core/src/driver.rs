//! C8 ReAct Driver: the top-level loop — prompt assembly, model call,
//! parse, dispatch to tools, observation handling, completion check.
//! Grounded on the teacher's `codex.rs` main-loop shape (message list +
//! step list + injected async model caller) and
//! `original_source/core/react_loop.py` for the completion predicate and
//! retry/error-classification policy.

use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, warn};

use crate::compactor::{self, ModelCaller};
use crate::config::AacodeConfig;
use crate::context_store::ContextStore;
use crate::error::{AacodeErr, Result};
use crate::event_log::{Event, EventLogger};
use crate::response_parser;
use crate::todo::TodoManager;
use crate::tool_registry::ToolRegistry;
use crate::types::{ActionItem, Message, Priority, Role, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Completed,
    MaxIterationsReached,
    Cancelled,
}

pub struct DriverResult {
    pub status: Status,
    pub iterations: usize,
    pub wall_clock: Duration,
    pub steps: Vec<Step>,
}

const RETRYABLE_MARKERS: &[&str] = &["timeout", "connection", "temporary", "暂时"];
const ERROR_MARKERS: &[&str] = &["traceback", "failed", "error", "exception", "错误", "失败"];

pub struct Driver<'a> {
    messages: Vec<Message>,
    steps: Vec<Step>,
    original_task: String,
    call_model: &'a ModelCaller,
    registry: &'a ToolRegistry,
    context: &'a ContextStore,
    logger: &'a EventLogger,
    todos: Option<&'a mut TodoManager>,
    config: &'a AacodeConfig,
    cancelled: bool,
}

impl<'a> Driver<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        system_prompt: &str,
        task: &str,
        call_model: &'a ModelCaller,
        registry: &'a ToolRegistry,
        context: &'a ContextStore,
        logger: &'a EventLogger,
        todos: Option<&'a mut TodoManager>,
        config: &'a AacodeConfig,
    ) -> Self {
        Self {
            messages: vec![Message::new(Role::System, system_prompt), Message::new(Role::User, task)],
            steps: Vec::new(),
            original_task: task.to_string(),
            call_model,
            registry,
            context,
            logger,
            todos,
            config,
            cancelled: false,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Cooperative cancellation: the outer loop stops after the currently
    /// running tool call (or its deadline) completes.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub async fn run(&mut self) -> Result<DriverResult> {
        let start = Instant::now();
        self.logger.log(Event::TaskStart { task: self.original_task.clone() });

        for iteration in 0..self.config.max_react_iterations {
            if self.cancelled {
                return Ok(self.finish(Status::Cancelled, iteration, start).await);
            }

            let call_start = Instant::now();
            let response = match (self.call_model)(self.messages.clone()).await {
                Ok(text) => {
                    self.logger.log(Event::ModelCall { response_time_ms: call_start.elapsed().as_millis(), ok: true });
                    text
                }
                Err(e) => {
                    self.logger.log(Event::ModelCall { response_time_ms: call_start.elapsed().as_millis(), ok: false });
                    self.logger.log(Event::Error { message: e.to_string() });
                    self.finish(Status::MaxIterationsReached, iteration, start).await;
                    return Err(e);
                }
            };

            let parsed = response_parser::parse(&response);

            if let Some(todos) = self.todos.as_deref_mut() {
                opportunistically_update_todo(todos, &parsed.thought).await;
            }

            let step_index = self.steps.len();
            self.steps.push(Step {
                thought: parsed.thought.clone(),
                actions: parsed.actions.clone(),
                timestamp: chrono::Utc::now(),
            });

            if parsed.actions.is_empty() {
                if self.recent_steps_have_errors(3) {
                    debug!("empty action with recent errors, continuing iteration {iteration}");
                } else {
                    match self.check_completion(&parsed.thought).await {
                        Ok(true) => return Ok(self.finish(Status::Completed, iteration + 1, start).await),
                        Ok(false) => {}
                        Err(_) => {
                            if !self.recent_steps_have_errors(3) {
                                return Ok(self.finish(Status::Completed, iteration + 1, start).await);
                            }
                        }
                    }
                }
                self.messages.push(Message::new(Role::Assistant, response.clone()));
                self.logger.log(Event::Iteration { index: iteration });
                continue;
            }

            let mut observations = Vec::with_capacity(parsed.actions.len());
            for (action_index, action) in self.steps[step_index].actions.clone().into_iter().enumerate() {
                let observation = self.execute_action(&action).await;
                observations.push(format!("动作 {} 结果: {}", action_index + 1, observation));
                self.steps[step_index].actions[action_index].observation = Some(observation);
            }
            let merged = observations.join("\n\n");

            self.messages.push(Message::new(Role::Assistant, response.clone()));
            self.messages.push(Message::new(Role::User, merged.clone()));

            if let Err(e) = self.context.update(&merged).await {
                warn!("context store update failed: {e}");
            }

            let token_count = compactor::estimate_tokens(&self.messages);
            if compactor::should_compact(token_count, self.config.compact_trigger_tokens) {
                match compactor::compact(&self.messages, &self.steps, self.config, self.context, self.call_model).await {
                    Ok(report) => {
                        self.logger.log(Event::ContextUpdate {
                            summary: format!("compacted {} -> {} tokens", report.tokens_before, report.tokens_after),
                        });
                        self.messages = report.messages;
                    }
                    Err(e) => warn!("compactor failed, continuing uncompacted: {e}"),
                }
            }

            self.logger.log(Event::Iteration { index: iteration });
        }

        Ok(self.finish(Status::MaxIterationsReached, self.config.max_react_iterations, start).await)
    }

    fn recent_steps_have_errors(&self, last_n: usize) -> bool {
        self.steps
            .iter()
            .rev()
            .take(last_n)
            .flat_map(|s| s.actions.iter())
            .filter_map(|a| a.observation.as_deref())
            .any(contains_error_marker)
    }

    /// Asks the model a short "is the task complete?" question, accepting
    /// only an answer beginning with `YES`/`NO`.
    async fn check_completion(&self, latest_thought: &str) -> Result<bool> {
        let recent_summary = self
            .steps
            .iter()
            .rev()
            .take(3)
            .flat_map(|s| s.actions.iter())
            .filter_map(|a| a.observation.as_deref())
            .map(|obs| {
                let tag = if contains_error_marker(obs) { "⚠️" } else { "✅" };
                format!("{tag} {}", obs.chars().take(200).collect::<String>())
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Original task: {}\nLatest thought: {}\nRecent observations:\n{}\n\n\
             Is the original task complete? Answer with YES or NO as the first word.",
            self.original_task, latest_thought, recent_summary
        );
        let messages = vec![Message::new(Role::User, prompt)];
        let response = tokio::time::timeout(self.config.model_summary_timeout(), (self.call_model)(messages))
            .await
            .map_err(|_| AacodeErr::ModelCall("completion check timed out".to_string()))??;

        let upper = response.trim().to_uppercase();
        Ok(upper.starts_with("YES"))
    }

    async fn execute_action(&self, action: &ActionItem) -> String {
        let validation = self.registry.validate_call(&action.tool_name, &action.params);
        if !validation.valid {
            let message = validation.error_message.unwrap_or_default();
            return message;
        }

        let Some(tool_fn) = self.registry.get_tool(&action.tool_name) else {
            return self.registry.format_tool_not_found_error(&action.tool_name, &[]);
        };

        let params = self.registry.normalize_params(&action.tool_name, &action.params);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let call_start = Instant::now();
            let outcome = tokio::time::timeout(self.config.tool_execution_timeout(), tool_fn(params.clone())).await;

            let (success, text) = match outcome {
                Ok(output) => (output.success, render_tool_output(&output)),
                Err(_) => (false, "执行超时".to_string()),
            };

            self.logger.log(Event::ToolCall {
                tool: action.tool_name.clone(),
                response_time_ms: call_start.elapsed().as_millis(),
                success,
            });

            if success || attempt > self.config.max_retries || !is_retryable(&text) {
                if !success {
                    if let Some(todos) = self.todos_ref() {
                        maybe_add_fix_item(todos, &action.tool_name, &text).await;
                    }
                }
                return text;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn todos_ref(&self) -> Option<&TodoManager> {
        self.todos.as_deref()
    }

    async fn finish(&self, status: Status, iterations: usize, start: Instant) -> DriverResult {
        let status_label = match status {
            Status::Completed => "completed",
            Status::MaxIterationsReached => "max_iterations_reached",
            Status::Cancelled => "cancelled",
        };
        self.logger.finish_task(status_label, iterations, start.elapsed()).await;
        DriverResult { status, iterations, wall_clock: start.elapsed(), steps: self.steps.clone() }
    }
}

fn render_tool_output(output: &crate::types::ToolOutput) -> String {
    if output.success {
        output.content.clone()
    } else {
        output.error.clone().unwrap_or_else(|| output.content.clone())
    }
}

fn contains_error_marker(text: &str) -> bool {
    let lower = text.to_lowercase();
    ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn is_retryable(text: &str) -> bool {
    let lower = text.to_lowercase();
    RETRYABLE_MARKERS.iter().any(|marker| lower.contains(marker))
}

async fn opportunistically_update_todo(todos: &mut TodoManager, thought: &str) {
    let lower = thought.to_lowercase();
    let planning = lower.contains("plan") || thought.contains("计划") || thought.contains("分析");
    let completed = lower.contains("complete") || lower.contains("done") || thought.contains("完成");
    if completed {
        let _ = todos.add_execution_record(&format!("thought indicated completion: {thought}")).await;
    } else if planning {
        let _ = todos.add_execution_record(&format!("planning: {thought}")).await;
    }
}

/// Classifies an observation's error type; returns `None` ("unknown") when
/// the match is too generic to act on, suppressing noisy todo items.
fn classify_error(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    if lower.contains("traceback") || lower.contains("exception") {
        Some("exception")
    } else if lower.contains("failed") || text.contains("失败") {
        Some("failure")
    } else if lower.contains("error") || text.contains("错误") {
        Some("error")
    } else {
        None
    }
}

async fn maybe_add_fix_item(todos: &TodoManager, tool_name: &str, observation: &str) {
    if let Some(kind) = classify_error(observation) {
        let text = format!("fix {tool_name} {kind}: {}", observation.chars().take(120).collect::<String>());
        let _ = todos.add_todo_item(&text, Priority::High, "bugfix").await;
    }
}

#[allow(dead_code)]
fn value_preview(value: &Value) -> String {
    value.to_string().chars().take(200).collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::types::{ParamType, Parameter, ToolOutput, ToolSchema};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn stub_caller(responses: Vec<&'static str>) -> Box<ModelCaller> {
        use std::sync::Mutex;
        let responses = Arc::new(Mutex::new(responses.into_iter()));
        Box::new(move |_messages| {
            let responses = responses.clone();
            Box::pin(async move {
                let next = responses.lock().unwrap().next().unwrap_or("YES");
                Ok(next.to_string())
            })
        })
    }

    fn registry_with_write_file() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        let schema = ToolSchema::new("write_file", "write a file").with_parameters(vec![
            Parameter::new("path", ParamType::String, true),
            Parameter::new("content", ParamType::String, true),
        ]);
        registry.register(schema, Arc::new(|_params: HashMap<String, Value>| Box::pin(async { ToolOutput::ok("written") })));
        registry
    }

    #[tokio::test]
    async fn single_action_task_completes_in_two_iterations() {
        let dir = tempfile::tempdir().unwrap();
        let context = ContextStore::new(dir.path(), 50).unwrap();
        let logger = EventLogger::new(&dir.path().join(".aacode/logs"), "task");
        let registry = registry_with_write_file();
        let config = AacodeConfig::default();
        let caller = stub_caller(vec![
            r#"{"thought":"创建文件","action":"write_file","action_input":{"path":"hello.py","content":"print('hi')"}}"#,
            "no more actions needed",
            "YES, task is complete",
        ]);

        let mut driver = Driver::new(
            "system",
            "创建 hello.py 内容为 print('hi')",
            &caller,
            &registry,
            &context,
            &logger,
            None,
            &config,
        );
        let result = driver.run().await.unwrap();
        assert_eq!(result.status, Status::Completed);
        assert_eq!(result.iterations, 2);
    }

    #[tokio::test]
    async fn unknown_tool_produces_observation_without_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let context = ContextStore::new(dir.path(), 50).unwrap();
        let logger = EventLogger::new(&dir.path().join(".aacode/logs"), "task");
        let registry = registry_with_write_file();
        let config = AacodeConfig::default();
        let caller = stub_caller(vec![
            r#"{"thought":"go","action":"wrt_file","action_input":{"path":"x","content":"y"}}"#,
            "YES",
        ]);
        let mut driver = Driver::new("system", "task", &caller, &registry, &context, &logger, None, &config);
        let result = driver.run().await.unwrap();
        let obs = result.steps[0].actions[0].observation.clone().unwrap();
        assert!(obs.contains("write_file"));
    }

    #[test]
    fn classify_error_returns_none_for_ambiguous_text() {
        assert_eq!(classify_error("everything looks fine today"), None);
        assert_eq!(classify_error("Traceback (most recent call last)"), Some("exception"));
    }

    #[test]
    fn is_retryable_matches_known_markers() {
        assert!(is_retryable("connection reset"));
        assert!(!is_retryable("permission denied"));
    }
}
