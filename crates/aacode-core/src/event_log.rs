//! C5 Event Logger: an append-only JSON-Lines log of every iteration,
//! model call, tool call, and context update. Grounded on the teacher's
//! `rollout.rs` (mpsc channel feeding a spawned writer task) and
//! `message_history.rs` (`fs2` advisory locking for concurrent-safe
//! appends).

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "task_start")]
    TaskStart { task: String },
    #[serde(rename = "iteration")]
    Iteration { index: usize },
    #[serde(rename = "model_call")]
    ModelCall { response_time_ms: u128, ok: bool },
    #[serde(rename = "tool_call")]
    ToolCall { tool: String, response_time_ms: u128, success: bool },
    #[serde(rename = "context_update")]
    ContextUpdate { summary: String },
    #[serde(rename = "error")]
    Error { message: String },
    #[serde(rename = "task_complete")]
    TaskComplete { status: String, iterations: usize, wall_clock_ms: u128 },
}

#[derive(Serialize)]
struct LogLine {
    timestamp: String,
    #[serde(flatten)]
    event: Event,
}

/// Writes are delegated to a background task so that a slow or failing
/// disk never blocks the Driver's hot loop; a write failure is reported
/// once to stderr and swallowed (spec.md §4.5).
pub struct EventLogger {
    path: PathBuf,
    sender: mpsc::UnboundedSender<Value>,
}

impl EventLogger {
    pub fn new(logs_dir: &Path, _task_label: &str) -> Self {
        std::fs::create_dir_all(logs_dir).ok();
        let filename = format!("agent_thought_and_action_{}.log", Utc::now().timestamp());
        let path = logs_dir.join(filename);

        let (sender, mut receiver) = mpsc::unbounded_channel::<Value>();
        let writer_path = path.clone();
        tokio::spawn(async move {
            let mut warned = false;
            while let Some(value) = receiver.recv().await {
                if let Err(e) = append_line(&writer_path, &value) {
                    if !warned {
                        eprintln!("event logger: failed to write {}: {e}", writer_path.display());
                        warned = true;
                    }
                }
            }
        });

        Self { path, sender }
    }

    pub fn log(&self, event: Event) {
        let line = LogLine {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };
        match serde_json::to_value(&line) {
            Ok(value) => {
                if self.sender.send(value).is_err() {
                    warn!("event logger channel closed");
                }
            }
            Err(e) => warn!("event logger: failed to serialize event: {e}"),
        }
    }

    /// Flushes, and writes a sibling `.summary.json`.
    pub async fn finish_task(&self, status: &str, iterations: usize, wall_clock: Duration) {
        self.log(Event::TaskComplete {
            status: status.to_string(),
            iterations,
            wall_clock_ms: wall_clock.as_millis(),
        });
        // Give the background writer a chance to drain before summarizing.
        tokio::task::yield_now().await;

        let summary_path = self.path.with_extension("summary.json");
        let summary = json!({
            "status": status,
            "iterations": iterations,
            "wall_clock_ms": wall_clock.as_millis(),
            "log_file": self.path.file_name().and_then(|n| n.to_str()),
        });
        if let Err(e) = std::fs::write(&summary_path, serde_json::to_string_pretty(&summary).unwrap_or_default()) {
            eprintln!("event logger: failed to write summary {}: {e}", summary_path.display());
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn append_line(path: &Path, value: &Value) -> std::io::Result<()> {
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    let result = {
        let mut file = &file;
        writeln!(file, "{value}")
    };
    FileExt::unlock(&file)?;
    result
}
