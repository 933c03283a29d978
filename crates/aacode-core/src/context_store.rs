//! C3 Context Store: persists archived payloads by content hash, and
//! maintains the latest-observation and error-history files. Grounded on
//! `original_source/utils/context_manager.py` for the assembly order and
//! truncation lengths, and on the teacher's `message_history.rs` for the
//! append-only-file-plus-index-line write pattern.

use std::fs;
use std::path::{Path, PathBuf};

use tokio::fs as afs;

use crate::error::Result;
use crate::safety::is_safe_path as guard_is_safe_path;
use crate::types::ArchiveKind;
use crate::util::content_hash;

const ERROR_KEYWORDS: &[&str] = &["error", "failed", "warning", "错误", "失败", "警告"];

pub struct ContextStore {
    project_path: PathBuf,
    context_dir: PathBuf,
    max_context_files: usize,
    current_todo_file: Option<PathBuf>,
}

impl ContextStore {
    pub fn new(project_path: impl Into<PathBuf>, max_context_files: usize) -> Result<Self> {
        let project_path = project_path.into();
        let context_dir = project_path.join(".aacode").join("context");
        fs::create_dir_all(&context_dir)?;
        Ok(Self {
            project_path,
            context_dir,
            max_context_files,
            current_todo_file: None,
        })
    }

    pub fn set_current_todo_file(&mut self, path: PathBuf) {
        self.current_todo_file = Some(path);
    }

    pub fn is_safe_path(&self, path: &str) -> bool {
        guard_is_safe_path(path, &self.project_path)
    }

    /// Compute the 8-hex-char content hash, scan `context_dir` for an
    /// existing archive whose filename already contains it (dedup), and
    /// otherwise write a new one and append to `archive_index.txt`.
    pub async fn save_large_output(&self, kind: ArchiveKind, identifier: &str, payload: &str) -> Result<String> {
        let hash = content_hash(payload.as_bytes());

        let mut entries = afs::read_dir(&self.context_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.contains(&hash) {
                let rel = self.context_dir.join(&*name);
                return Ok(relative_to(&rel, &self.project_path));
            }
        }

        let safe_identifier = sanitize_identifier(identifier);
        let filename = format!("{}_{}_{}.txt", kind.as_str(), safe_identifier, hash);
        let path = self.context_dir.join(&filename);
        afs::write(&path, payload).await?;

        let index_path = self.context_dir.join("archive_index.txt");
        let timestamp = chrono::Utc::now().timestamp();
        let line = format!("{filename}|{hash}|{}|{timestamp}\n", payload.len());
        if !index_path.exists() {
            afs::write(&index_path, format!("# archive index\n# format: name|hash|size|timestamp\n{line}")).await?;
        } else {
            use tokio::io::AsyncWriteExt;
            let mut file = afs::OpenOptions::new().append(true).open(&index_path).await?;
            file.write_all(line.as_bytes()).await?;
        }

        Ok(relative_to(&path, &self.project_path))
    }

    /// Write `latest_observation.txt` (truncated to 500 chars), push into
    /// the 5-entry `observation_history.txt` ring, and append to
    /// `important_errors.txt` if an error keyword is present.
    pub async fn update(&self, observation: &str) -> Result<()> {
        if observation.is_empty() {
            return Ok(());
        }

        let truncated_latest = truncate_chars(observation, 500);
        afs::write(self.context_dir.join("latest_observation.txt"), &truncated_latest).await?;

        let history_path = self.context_dir.join("observation_history.txt");
        let existing = afs::read_to_string(&history_path).await.unwrap_or_default();
        let mut entries: Vec<String> = if existing.trim().is_empty() {
            Vec::new()
        } else {
            existing.trim().split("\n---\n").map(str::to_string).collect()
        };
        entries.push(truncate_chars(observation, 1000));
        if entries.len() > 5 {
            let drop = entries.len() - 5;
            entries.drain(0..drop);
        }
        afs::write(&history_path, entries.join("\n---\n")).await?;

        if contains_error_keyword(observation) {
            let errors_path = self.context_dir.join("important_errors.txt");
            let existing_errors = afs::read_to_string(&errors_path).await.unwrap_or_default();
            let mut combined = existing_errors;
            combined.push_str(&truncate_chars(observation, 500));
            combined.push('\n');
            combined = tail_chars(&combined, 3000);
            afs::write(&errors_path, combined).await?;
        }

        Ok(())
    }

    /// Assemble the structured preamble in the order `original_source`
    /// resolves: init.md, todo-file pointer, latest observation, up to 3
    /// prior history entries, recent errors, workspace path, file listing.
    pub async fn get_context(&self) -> Result<String> {
        let mut parts = Vec::new();

        let init_path = self.project_path.join("init.md");
        parts.push(match afs::read_to_string(&init_path).await {
            Ok(content) if !content.trim().is_empty() => {
                format!("## Project init instructions (init.md)\n{}", truncate_chars(&content, 1500))
            }
            Ok(_) => "## Project init instructions\n⚠️ init.md is empty".to_string(),
            Err(_) => "## Project init instructions\n⚠️ init.md does not exist".to_string(),
        });

        if let Some(todo_file) = &self.current_todo_file {
            if let Ok(rel) = todo_file.strip_prefix(&self.project_path) {
                parts.push(format!(
                    "## Current todo list\nfile: {}\nhint: todo tools use this file automatically",
                    rel.display()
                ));
            }
        }

        if let Ok(latest) = afs::read_to_string(self.context_dir.join("latest_observation.txt")).await {
            if !latest.trim().is_empty() {
                parts.push(format!("## Latest observation\n{}", truncate_chars(&latest, 1500)));
            }
        }

        if let Ok(history) = afs::read_to_string(self.context_dir.join("observation_history.txt")).await {
            let entries: Vec<&str> = history.trim().split("\n---\n").filter(|s| !s.is_empty()).collect();
            if entries.len() > 1 {
                let prior = &entries[..entries.len() - 1];
                let recent = &prior[prior.len().saturating_sub(3)..];
                if !recent.is_empty() {
                    parts.push(format!("## Recent observation history\n{}", recent.join("\n---\n")));
                }
            }
        }

        if let Ok(errors) = afs::read_to_string(self.context_dir.join("important_errors.txt")).await {
            if !errors.trim().is_empty() {
                let tail = tail_chars(&errors, 800);
                parts.push(format!("## ⚠️ Recent error history (avoid repeating)\n{tail}"));
            }
        }

        parts.push(format!(
            "## Working directory\ncurrent working directory: {}",
            self.project_path.display()
        ));

        parts.push(self.file_listing().await);

        Ok(parts.join("\n\n"))
    }

    async fn file_listing(&self) -> String {
        const EXTENSIONS: &[&str] = &["py", "md", "txt", "json", "yaml", "yml", "csv", "xlsx", "pdf", "rs", "toml"];
        let mut files = Vec::new();
        collect_files(&self.project_path, &self.project_path, EXTENSIONS, &mut files);
        files.sort();
        prioritize_files(&mut files);

        if files.is_empty() {
            return "## Project file listing\nproject directory is empty".to_string();
        }
        let truncated = files.len() > self.max_context_files;
        files.truncate(self.max_context_files);
        if truncated {
            format!(
                "## Project file listing\n(showing first {} files)\n{}",
                self.max_context_files,
                files.join("\n")
            )
        } else {
            format!("## Project file listing\n{}", files.join("\n"))
        }
    }
}

fn collect_files(root: &Path, dir: &Path, extensions: &[&str], out: &mut Vec<String>) {
    let Ok(read_dir) = fs::read_dir(dir) else { return };
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.components().any(|c| c.as_os_str() == ".aacode") {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, extensions, out);
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if extensions.contains(&ext) {
                if let Ok(rel) = path.strip_prefix(root) {
                    out.push(rel.display().to_string());
                }
            }
        }
    }
}

/// README/init.md/config files first, then data, then source, then other —
/// the priority order `_prioritize_files` applies in `context_manager.py`.
fn prioritize_files(files: &mut [String]) {
    fn rank(name: &str) -> u8 {
        let lower = name.to_lowercase();
        if lower.contains("readme") || lower.contains("init.md") || lower.ends_with(".toml") || lower.ends_with(".yaml") || lower.ends_with(".yml") {
            0
        } else if lower.ends_with(".json") || lower.ends_with(".csv") {
            1
        } else if lower.ends_with(".rs") || lower.ends_with(".py") {
            2
        } else {
            3
        }
    }
    files.sort_by(|a, b| rank(a).cmp(&rank(b)).then_with(|| a.cmp(b)));
}

fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect::<String>()
        .chars()
        .take(60)
        .collect()
}

fn relative_to(path: &Path, base: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).display().to_string()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn tail_chars(text: &str, max: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(max);
    chars[start..].iter().collect()
}

fn contains_error_keyword(text: &str) -> bool {
    let lower = text.to_lowercase();
    ERROR_KEYWORDS.iter().any(|kw| lower.contains(&kw.to_lowercase()))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    async fn store() -> (ContextStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = ContextStore::new(dir.path(), 50).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn save_large_output_dedups_identical_payload() {
        let (store, _dir) = store().await;
        let a = store.save_large_output(ArchiveKind::ShellOutput, "ls -la", "same content").await.unwrap();
        let b = store.save_large_output(ArchiveKind::ShellOutput, "ls -la", "same content").await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn save_large_output_differs_for_different_payload() {
        let (store, _dir) = store().await;
        let a = store.save_large_output(ArchiveKind::ShellOutput, "ls", "one").await.unwrap();
        let b = store.save_large_output(ArchiveKind::ShellOutput, "ls", "two").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn update_writes_latest_and_detects_error_keyword() {
        let (store, dir) = store().await;
        store.update("Traceback: failed to run").await.unwrap();
        let errors = fs::read_to_string(dir.path().join(".aacode/context/important_errors.txt")).unwrap();
        assert!(errors.contains("failed"));
    }

    #[tokio::test]
    async fn get_context_reports_missing_init_md() {
        let (store, _dir) = store().await;
        let context = store.get_context().await.unwrap();
        assert!(context.contains("init.md does not exist"));
    }

    #[tokio::test]
    async fn get_context_includes_workspace_path() {
        let (store, dir) = store().await;
        let context = store.get_context().await.unwrap();
        assert!(context.contains(&dir.path().display().to_string()));
    }

    #[tokio::test]
    async fn important_errors_tail_trim_does_not_panic_on_multibyte_boundary() {
        let (store, dir) = store().await;
        for _ in 0..20 {
            store.update("错误: 命令被安全护栏拒绝 — repeated failure warning 警告").await.unwrap();
        }
        let errors = fs::read_to_string(dir.path().join(".aacode/context/important_errors.txt")).unwrap();
        assert!(errors.chars().count() <= 3000);
    }
}
