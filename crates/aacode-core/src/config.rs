//! Runtime configuration for the orchestration core.
//!
//! Mirrors the teacher's `config.rs` in spirit (a single struct with
//! documented defaults, optionally overridden from a TOML file) but carries
//! only the options spec.md §6 recognizes — config file *discovery*
//! (project vs. global layers, profile merging) is out of scope here.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{AacodeErr, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AacodeConfig {
    pub max_react_iterations: usize,
    pub max_sub_agent_iterations: usize,
    pub compact_trigger_tokens: usize,
    pub compact_keep_messages: usize,
    pub compact_keep_rounds: usize,
    pub compact_summary_steps: usize,
    pub compact_protect_first_rounds: usize,
    pub max_tokens_per_session: usize,
    pub shell_command_timeout_secs: u64,
    pub tool_execution_timeout_secs: u64,
    pub model_summary_timeout_secs: u64,
    pub code_execution_timeout_secs: u64,
    pub max_file_list_results: usize,
    pub max_search_results: usize,
    pub max_retries: u32,
    pub max_auto_read_lines: usize,
    pub max_context_files: usize,
    pub test_output_threshold: usize,
    pub code_content_threshold: usize,
    pub normal_output_threshold: usize,
    pub test_output_preview: usize,
    pub code_content_preview: usize,
    pub normal_output_preview: usize,
}

impl Default for AacodeConfig {
    fn default() -> Self {
        Self {
            max_react_iterations: 50,
            max_sub_agent_iterations: 30,
            compact_trigger_tokens: 8000,
            compact_keep_messages: 20,
            compact_keep_rounds: 8,
            compact_summary_steps: 10,
            compact_protect_first_rounds: 3,
            max_tokens_per_session: 200_000,
            shell_command_timeout_secs: 30,
            tool_execution_timeout_secs: 60,
            model_summary_timeout_secs: 30,
            code_execution_timeout_secs: 60,
            max_file_list_results: 100,
            max_search_results: 20,
            max_retries: 3,
            max_auto_read_lines: 200,
            max_context_files: 50,
            test_output_threshold: 15_000,
            code_content_threshold: 30_000,
            normal_output_threshold: 15_000,
            test_output_preview: 2_000,
            code_content_preview: 2_000,
            normal_output_preview: 1_000,
        }
    }
}

impl AacodeConfig {
    pub fn shell_command_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_command_timeout_secs)
    }

    pub fn tool_execution_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_execution_timeout_secs)
    }

    pub fn model_summary_timeout(&self) -> Duration {
        Duration::from_secs(self.model_summary_timeout_secs)
    }

    /// Load overrides from an `aacode.toml` file, falling back to defaults
    /// for any key the file does not set. Missing file is not an error.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| AacodeErr::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = AacodeConfig::default();
        assert_eq!(cfg.max_react_iterations, 50);
        assert_eq!(cfg.compact_trigger_tokens, 8000);
        assert_eq!(cfg.compact_keep_rounds, 8);
        assert_eq!(cfg.max_tokens_per_session, 200_000);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = AacodeConfig::load_from_path(Path::new("/nonexistent/aacode.toml")).unwrap();
        assert_eq!(cfg.max_retries, 3);
    }

    #[test]
    fn partial_override_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aacode.toml");
        std::fs::write(&path, "max_react_iterations = 10\n").unwrap();
        let cfg = AacodeConfig::load_from_path(&path).unwrap();
        assert_eq!(cfg.max_react_iterations, 10);
        assert_eq!(cfg.compact_trigger_tokens, 8000);
    }
}
