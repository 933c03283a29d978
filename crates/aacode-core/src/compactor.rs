//! C7 Compactor: summarizes middle conversation turns and offloads large
//! observations to the Context Store, rewriting the Driver's message list.
//! Implements spec.md §4.7's seven-step algorithm.

use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::Value;
use tracing::warn;

use crate::config::AacodeConfig;
use crate::context_store::ContextStore;
use crate::error::Result;
use crate::types::{ArchiveKind, Message, Role, Step};
use crate::util::approximate_token_count;

pub type ModelCaller =
    dyn Fn(Vec<Message>) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync;

pub struct CompactionReport {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub messages: Vec<Message>,
}

fn code_fence_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    #[allow(clippy::expect_used)]
    RE.get_or_init(|| Regex::new(r"(?s)```.*?```").expect("static pattern"))
}

/// Runs the full compaction algorithm over `messages`, archiving the Step
/// history first.
pub async fn compact(
    messages: &[Message],
    steps: &[Step],
    config: &AacodeConfig,
    context: &ContextStore,
    call_model: &ModelCaller,
) -> Result<CompactionReport> {
    let tokens_before: usize = messages.iter().map(|m| m.token_count).sum();

    let steps_json = serde_json::to_string_pretty(steps).unwrap_or_default();
    let history_archive_path = context
        .save_large_output(ArchiveKind::CodeOutput, "step_history", &steps_json)
        .await?;

    let system_count = 2.min(messages.len());
    let protect_count = (config.compact_protect_first_rounds * 2).min(messages.len().saturating_sub(system_count));
    let keep_count = (config.compact_keep_rounds * 2).min(messages.len().saturating_sub(system_count + protect_count));

    let system = &messages[..system_count];
    let first_rounds_end = system_count + protect_count;
    let first_rounds = &messages[system_count..first_rounds_end];
    let recent_start = messages.len().saturating_sub(keep_count).max(first_rounds_end);
    let middle = &messages[first_rounds_end..recent_start];
    let recent = &messages[recent_start..];

    let archived_middle: Vec<Message> = archive_large_blobs(middle, context).await?;

    let summary = match summarize_middle(&archived_middle, config, call_model).await {
        Ok(summary) => summary,
        Err(e) => {
            warn!("compactor: summarization call failed, falling back to truncation: {e}");
            fallback_summary(&archived_middle)
        }
    };

    let synthetic = Message::new(
        Role::System,
        format!(
            "## Compacted history summary\n\n{}\n\nFull step history archived at: {}",
            summary, history_archive_path
        ),
    );

    let mut rebuilt = Vec::with_capacity(system.len() + first_rounds.len() + 1 + recent.len());
    rebuilt.extend(system.iter().cloned());
    rebuilt.extend(first_rounds.iter().cloned());
    rebuilt.push(synthetic);
    rebuilt.extend(recent.iter().cloned());

    let tokens_after: usize = rebuilt.iter().map(|m| m.token_count).sum();

    Ok(CompactionReport { tokens_before, tokens_after, messages: rebuilt })
}

/// Replaces large embedded blobs inline with a short citation: kind,
/// identifier, archive path, size, hash, and an error/success marker.
async fn archive_large_blobs(messages: &[Message], context: &ContextStore) -> Result<Vec<Message>> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let mut content = message.content.clone();

        let fence_spans: Vec<(usize, usize)> = code_fence_pattern()
            .find_iter(&content)
            .map(|m| (m.start(), m.end()))
            .filter(|(s, e)| e - s >= 500)
            .collect();

        if !fence_spans.is_empty() {
            let mut rebuilt = String::new();
            let mut cursor = 0;
            for (start, end) in fence_spans {
                rebuilt.push_str(&content[cursor..start]);
                let blob = &content[start..end];
                let citation = archive_and_cite(context, ArchiveKind::CodeOutput, "fenced_block", blob).await?;
                rebuilt.push_str(&citation);
                cursor = end;
            }
            rebuilt.push_str(&content[cursor..]);
            content = rebuilt;
        } else if content.len() > 1500 && looks_like_tool_output(&content) {
            let kind = if content.contains("$") || content.contains("stdout") {
                ArchiveKind::ShellOutput
            } else {
                ArchiveKind::SearchResults
            };
            content = archive_and_cite(context, kind, "message_body", &content).await?;
        }

        let mut archived = message.clone();
        archived.content = content;
        out.push(archived);
    }
    Ok(out)
}

fn looks_like_tool_output(text: &str) -> bool {
    text.contains("returncode") || text.contains("stdout") || text.contains("匹配") || text.contains("results")
}

async fn archive_and_cite(context: &ContextStore, kind: ArchiveKind, identifier: &str, blob: &str) -> Result<String> {
    let path = context.save_large_output(kind, identifier, blob).await?;
    let hash = crate::util::content_hash(blob.as_bytes());
    let marker = if contains_error_marker(blob) { "⚠️" } else { "✅" };
    Ok(format!(
        "[{marker} archived {} `{}` -> {} ({} bytes, hash {hash})]",
        kind.display_name(),
        identifier,
        path,
        blob.len()
    ))
}

fn contains_error_marker(text: &str) -> bool {
    ["error", "failed", "exception", "traceback", "错误", "失败"]
        .iter()
        .any(|kw| text.to_lowercase().contains(kw))
}

/// Calls the model with a dedicated summarization prompt over the
/// already-shrunk middle, producing three tagged summaries.
async fn summarize_middle(middle: &[Message], config: &AacodeConfig, call_model: &ModelCaller) -> Result<String> {
    if middle.is_empty() {
        return Ok("(no middle turns to summarize)".to_string());
    }

    let transcript: String = middle
        .iter()
        .map(|m| format!("{:?}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let prompt = format!(
        "Summarize the following conversation excerpt as JSON with keys \
         `file_activity`, `tool_activity`, and `must_preserve` (unresolved \
         errors or key decisions). Keep each value under {} characters.\n\n{}",
        config.compact_summary_steps * 200,
        transcript
    );

    let system = Message::new(Role::System, "You are a terse conversation summarizer.");
    let user = Message::new(Role::User, prompt);
    let response = call_model(vec![system, user]).await?;

    match serde_json::from_str::<Value>(&response) {
        Ok(Value::Object(map)) => {
            let file_activity = map.get("file_activity").and_then(Value::as_str).unwrap_or("");
            let tool_activity = map.get("tool_activity").and_then(Value::as_str).unwrap_or("");
            let must_preserve = map.get("must_preserve").and_then(Value::as_str).unwrap_or("");
            Ok(format!(
                "**File activity:** {file_activity}\n**Tool activity:** {tool_activity}\n**Must preserve:** {must_preserve}"
            ))
        }
        _ => Ok(response.chars().take(2000).collect()),
    }
}

fn fallback_summary(middle: &[Message]) -> String {
    let total_tokens: usize = middle.iter().map(|m| m.token_count).sum();
    format!("(summarization unavailable; {} messages / ~{} tokens truncated)", middle.len(), total_tokens)
}

/// Returns whether compaction should run for this token count (strict
/// `>`, per spec.md §8's boundary behavior).
pub fn should_compact(token_count: usize, trigger: usize) -> bool {
    token_count > trigger
}

pub fn estimate_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| if m.token_count > 0 { m.token_count } else { approximate_token_count(&m.content) })
        .sum()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    fn config() -> AacodeConfig {
        AacodeConfig {
            compact_protect_first_rounds: 1,
            compact_keep_rounds: 1,
            ..AacodeConfig::default()
        }
    }

    fn stub_caller(response: &'static str) -> Box<ModelCaller> {
        Box::new(move |_messages| Box::pin(async move { Ok(response.to_string()) }))
    }

    #[tokio::test]
    async fn compaction_preserves_system_and_recent_messages() {
        let dir = tempfile::tempdir().unwrap();
        let context = ContextStore::new(dir.path(), 50).unwrap();
        let mut messages = vec![
            Message::new(Role::System, "system preamble"),
            Message::new(Role::User, "initial task"),
        ];
        for i in 0..20 {
            messages.push(Message::new(Role::Assistant, format!("assistant turn {i}")));
            messages.push(Message::new(Role::User, format!("observation {i}")));
        }
        let cfg = config();
        let caller = stub_caller(r#"{"file_activity":"a","tool_activity":"b","must_preserve":"c"}"#);
        let steps = Vec::new();
        let report = compact(&messages, &steps, &cfg, &context, &caller).await.unwrap();

        assert_eq!(report.messages[0].content, messages[0].content);
        assert_eq!(report.messages[1].content, messages[1].content);
        let recent_len = cfg.compact_keep_rounds * 2;
        let tail_expected = &messages[messages.len() - recent_len..];
        let tail_actual = &report.messages[report.messages.len() - recent_len..];
        for (expected, actual) in tail_expected.iter().zip(tail_actual.iter()) {
            assert_eq!(expected.content, actual.content);
        }
    }

    #[tokio::test]
    async fn compaction_emits_one_synthetic_summary_with_archive_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let context = ContextStore::new(dir.path(), 50).unwrap();
        let mut messages = vec![Message::new(Role::System, "sys"), Message::new(Role::User, "task")];
        for i in 0..10 {
            messages.push(Message::new(Role::Assistant, format!("turn {i}")));
            messages.push(Message::new(Role::User, format!("obs {i}")));
        }
        let cfg = config();
        let caller = stub_caller(r#"{"file_activity":"a","tool_activity":"b","must_preserve":"c"}"#);
        let report = compact(&messages, &[], &cfg, &context, &caller).await.unwrap();
        let synthetic_count = report.messages.iter().filter(|m| m.content.contains(".aacode/context/")).count();
        assert_eq!(synthetic_count, 1);
    }

    #[test]
    fn should_compact_is_strict_greater_than() {
        assert!(!should_compact(8000, 8000));
        assert!(should_compact(8001, 8000));
    }
}
