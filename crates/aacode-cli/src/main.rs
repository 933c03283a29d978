//! Demo harness that wires a stub model caller and a handful of demo
//! tools to drive `aacode_core::Driver` end to end. Not the CLI the
//! orchestration core's specification places out of scope — this carries
//! no config-file discovery, skills/MCP wiring, or UX polish.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use aacode_core::config::AacodeConfig;
use aacode_core::context_store::ContextStore;
use aacode_core::event_log::EventLogger;
use aacode_core::safety;
use aacode_core::todo::TodoManager;
use aacode_core::tool_registry::ToolRegistry;
use aacode_core::types::{ParamType, Parameter, ToolOutput, ToolSchema};
use aacode_core::Driver;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

fn build_registry(project_root: std::path::PathBuf, shell_timeout: std::time::Duration) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(
        ToolSchema::new("write_file", "Write text content to a file in the workspace").with_parameters(vec![
            Parameter::new("path", ParamType::String, true)
                .with_description("destination path relative to the workspace")
                .with_aliases(["filepath", "file_path"]),
            Parameter::new("content", ParamType::String, true).with_description("file content"),
        ]),
        Arc::new(|params: HashMap<String, Value>| {
            Box::pin(async move {
                let path = params.get("path").and_then(Value::as_str).unwrap_or("");
                let content = params.get("content").and_then(Value::as_str).unwrap_or("");
                match std::fs::write(path, content) {
                    Ok(()) => ToolOutput::ok(format!("wrote {} bytes to {path}", content.len())),
                    Err(e) => ToolOutput::err(e.to_string()),
                }
            })
        }),
    );

    registry.register(
        ToolSchema::new("read_file", "Read a file's contents").with_parameters(vec![Parameter::new(
            "path",
            ParamType::String,
            true,
        )
        .with_aliases(["filepath", "file_path"])
        .with_description("path to read")]),
        Arc::new(|params: HashMap<String, Value>| {
            Box::pin(async move {
                let path = params.get("path").and_then(Value::as_str).unwrap_or("");
                match std::fs::read_to_string(path) {
                    Ok(content) => ToolOutput::ok(content),
                    Err(e) => ToolOutput::err(e.to_string()),
                }
            })
        }),
    );

    // Mirrors `original_source/tools/atomic_tools.py::run_shell`: the
    // Safety Guard is consulted by the tool body, not by the Driver, and
    // a non-zero exit code is carried in `returncode` rather than treated
    // as tool failure — only a rejection or spawn error is `success: false`.
    registry.register(
        ToolSchema::new("run_shell", "Run a shell command in the workspace").with_parameters(vec![
            Parameter::new("command", ParamType::String, true).with_description("the command line to execute"),
        ]),
        Arc::new(move |params: HashMap<String, Value>| {
            let project_root = project_root.clone();
            Box::pin(async move {
                let command = params.get("command").and_then(Value::as_str).unwrap_or("").to_string();
                let decision = safety::classify_command(&command, &project_root, false);
                if !decision.allowed {
                    return ToolOutput::err(format!("命令被安全护栏拒绝: {}", decision.reason));
                }

                let spawned = tokio::process::Command::new("sh")
                    .arg("-c")
                    .arg(&command)
                    .current_dir(&project_root)
                    .output();
                match tokio::time::timeout(shell_timeout, spawned).await {
                    Ok(Ok(output)) => {
                        let mut result = ToolOutput::ok(String::from_utf8_lossy(&output.stdout).into_owned());
                        result.stdout = Some(String::from_utf8_lossy(&output.stdout).into_owned());
                        result.stderr = Some(String::from_utf8_lossy(&output.stderr).into_owned());
                        result.returncode = output.status.code();
                        result
                    }
                    Ok(Err(e)) => ToolOutput::err(format!("工具执行异常: {e}")),
                    Err(_) => ToolOutput::ok(format!("命令执行超时 ({}秒)", shell_timeout.as_secs())),
                }
            })
        }),
    );

    registry
}

/// A stub model caller standing in for the real LLM transport, which
/// spec.md places out of scope. Writes `hello.py` once, then answers the
/// Driver's completion check affirmatively (S1's two-iteration shape).
fn stub_model_caller() -> Box<aacode_core::compactor::ModelCaller> {
    let wrote_file = std::sync::atomic::AtomicBool::new(false);
    Box::new(move |messages| {
        let asks_completion =
            messages.last().is_some_and(|m| m.content.contains("Is the original task complete?"));
        let already_wrote = wrote_file.swap(true, std::sync::atomic::Ordering::SeqCst);
        Box::pin(async move {
            if asks_completion {
                Ok("YES, the demo file was written.".to_string())
            } else if already_wrote {
                Ok(r#"{"thought":"task complete"}"#.to_string())
            } else {
                Ok(r#"{"thought":"creating the demo file","action":"write_file","action_input":{"path":"hello.py","content":"print('hi')"}}"#.to_string())
            }
        })
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let workdir = env::current_dir()?;
    let config = AacodeConfig::load_from_path(&workdir.join("aacode.toml"))?;

    let registry = build_registry(workdir.clone(), config.shell_command_timeout());
    let context = ContextStore::new(&workdir, config.max_context_files)?;
    let logger = EventLogger::new(&workdir.join(".aacode").join("logs"), "demo");
    let mut todos = TodoManager::new(&workdir)?;
    todos.create_todo_list("demo task", None).await?;

    let caller = stub_model_caller();
    let mut driver = Driver::new(
        "You are a terse coding assistant.",
        "demonstrate the orchestration core end to end",
        &caller,
        &registry,
        &context,
        &logger,
        Some(&mut todos),
        &config,
    );

    let result = driver.run().await?;
    println!("status: {:?}, iterations: {}", result.status, result.iterations);
    Ok(())
}
