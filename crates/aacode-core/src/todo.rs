//! C9 Todo Manager: an append-only per-task Markdown checklist with an
//! execution-record journal. Grounded on
//! `original_source/utils/todo_manager.py` (incremental line edits rather
//! than full-file rewrites) and the teacher's `plan_tool.rs` for the
//! status/priority typing.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs as afs;

use crate::error::Result;
use crate::types::Priority;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoSummary {
    pub empty: bool,
    pub project_name: Option<String>,
    pub todo_file: Option<String>,
    pub total_todos: usize,
    pub completed_todos: usize,
    pub pending_todos: usize,
    pub completion_rate: f64,
}

pub struct TodoManager {
    project_path: PathBuf,
    todo_dir: PathBuf,
    current_todo_file: Option<PathBuf>,
}

impl TodoManager {
    pub fn new(project_path: impl Into<PathBuf>) -> Result<Self> {
        let project_path = project_path.into();
        let todo_dir = project_path.join(".aacode").join("todos");
        std::fs::create_dir_all(&todo_dir)?;
        Ok(Self { project_path, todo_dir, current_todo_file: None })
    }

    pub fn current_todo_file(&self) -> Option<&Path> {
        self.current_todo_file.as_deref()
    }

    /// Writes the fixed three-section skeleton with a starter checklist
    /// and one creation-time Records line, returning the file's path
    /// relative to the project root.
    pub async fn create_todo_list(&mut self, task_description: &str, project_name: Option<&str>) -> Result<String> {
        let project_name = project_name
            .map(str::to_string)
            .unwrap_or_else(|| self.project_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "project".to_string()));
        let clean_name = sanitize_name(&project_name);

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let filename = format!("{clean_name}_to-do-list_{timestamp}.md");
        let path = self.todo_dir.join(&filename);

        let content = format!(
            "# {clean_name} - Todo list\n\n\
             **Task**: {task_description}\n\
             **Created**: {created}\n\n\
             ## Pending\n\
             - [ ] Analyze requirements\n\
             - [ ] Draft a plan\n\
             - [ ] Execute the task\n\n\
             ## Completed\n\
             (none yet)\n\n\
             ## Records\n\
             - {time} list created\n\n\
             ---\n\
             *auto-maintained*\n",
            created = Utc::now().format("%Y-%m-%d %H:%M:%S"),
            time = Utc::now().format("%H:%M:%S"),
        );

        afs::write(&path, content).await?;
        self.current_todo_file = Some(path.clone());
        Ok(relative(&path, &self.project_path))
    }

    /// Inserts immediately after the `## Pending` heading, newest-first.
    pub async fn add_todo_item(&self, item: &str, priority: Priority, category: &str) -> Result<bool> {
        let Some(path) = &self.current_todo_file else { return Ok(false) };
        let content = afs::read_to_string(path).await?;
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

        let Some(insert_pos) = lines.iter().position(|l| l.trim() == "## Pending") else { return Ok(false) };
        let new_line = format!("- [ ] {} **{category}**: {item}", priority.glyph());
        lines.insert(insert_pos + 1, new_line);

        afs::write(path, lines.join("\n")).await?;
        Ok(true)
    }

    /// Flips the first pending line containing `pattern` to `[x]` and
    /// copies it into `## Completed` with a timestamp.
    pub async fn mark_todo_completed(&self, pattern: &str) -> Result<bool> {
        let Some(path) = &self.current_todo_file else { return Ok(false) };
        let content = afs::read_to_string(path).await?;
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

        let mut updated = false;
        for i in 0..lines.len() {
            let line = lines[i].clone();
            if line.trim_start().starts_with("- [ ]") && line.to_lowercase().contains(&pattern.to_lowercase()) {
                lines[i] = line.replacen("- [ ]", "- [x]", 1);
                let item_desc = strip_priority_and_category(&line);
                insert_into_completed(&mut lines, &item_desc);
                updated = true;
                break;
            }
        }

        if updated {
            afs::write(path, lines.join("\n")).await?;
        }
        Ok(updated)
    }

    pub async fn update_todo_item(&self, old_pattern: &str, new_text: &str) -> Result<bool> {
        let Some(path) = &self.current_todo_file else { return Ok(false) };
        let content = afs::read_to_string(path).await?;
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

        let mut updated = false;
        for line in &mut lines {
            if line.trim_start().starts_with("- [ ]") && line.to_lowercase().contains(&old_pattern.to_lowercase()) {
                if let Some((glyph, category)) = extract_glyph_and_category(line) {
                    *line = format!("- [ ] {glyph} **{category}**: {new_text}");
                } else {
                    *line = format!("- [ ] {new_text}");
                }
                updated = true;
            }
        }

        if updated {
            afs::write(path, lines.join("\n")).await?;
        }
        Ok(updated)
    }

    /// Appends one record, capped at 20 by dropping the oldest.
    pub async fn add_execution_record(&self, text: &str) -> Result<bool> {
        let Some(path) = &self.current_todo_file else { return Ok(false) };
        let content = afs::read_to_string(path).await?;
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

        let Some(record_pos) = lines.iter().position(|l| l.trim() == "## Records") else { return Ok(false) };
        let truncated: String = text.chars().take(80).collect();
        let new_record = format!("- {} {truncated}", Utc::now().format("%H:%M:%S"));
        lines.insert(record_pos + 1, new_record);

        let record_positions: Vec<usize> = lines
            .iter()
            .enumerate()
            .skip(record_pos + 1)
            .filter(|(_, l)| l.trim_start().starts_with("- "))
            .map(|(i, _)| i)
            .collect();
        if record_positions.len() > 20 {
            let drop_count = record_positions.len() - 20;
            let oldest = &record_positions[record_positions.len() - drop_count..];
            for &pos in oldest.iter().rev() {
                lines.remove(pos);
            }
        }

        afs::write(path, lines.join("\n")).await?;
        Ok(true)
    }

    pub async fn get_todo_summary(&self) -> Result<TodoSummary> {
        let Some(path) = &self.current_todo_file else {
            return Ok(TodoSummary {
                empty: true,
                project_name: None,
                todo_file: None,
                total_todos: 0,
                completed_todos: 0,
                pending_todos: 0,
                completion_rate: 0.0,
            });
        };
        let content = afs::read_to_string(path).await?;
        let mut pending = 0usize;
        let mut completed = 0usize;
        let mut project_name = None;
        for line in content.lines() {
            let trimmed = line.trim_start();
            if trimmed.starts_with("- [ ]") {
                pending += 1;
            } else if trimmed.starts_with("- [x]") {
                completed += 1;
            } else if line.starts_with("# ") && project_name.is_none() {
                project_name = Some(line.trim_start_matches("# ").split(" - ").next().unwrap_or("").to_string());
            }
        }
        let total = pending + completed;
        Ok(TodoSummary {
            empty: false,
            project_name,
            todo_file: Some(relative(path, &self.project_path)),
            total_todos: total,
            completed_todos: completed,
            pending_todos: pending,
            completion_rate: if total > 0 { completed as f64 / total as f64 * 100.0 } else { 0.0 },
        })
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() || cleaned == "." {
        "project".to_string()
    } else {
        cleaned
    }
}

fn relative(path: &Path, base: &Path) -> String {
    path.strip_prefix(base).unwrap_or(path).display().to_string()
}

fn strip_priority_and_category(checked_line: &str) -> String {
    let without_checkbox = checked_line.replacen("- [x]", "", 1).trim().to_string();
    if let Some(colon) = without_checkbox.find("**:") {
        without_checkbox[colon + 3..].trim().to_string()
    } else {
        without_checkbox
    }
}

fn extract_glyph_and_category(line: &str) -> Option<(String, String)> {
    let rest = line.trim_start().strip_prefix("- [ ]")?.trim();
    let (glyph, rest) = if let Some(first) = rest.chars().next() {
        if !first.is_ascii() {
            (first.to_string(), rest.chars().skip(1).collect::<String>().trim().to_string())
        } else {
            (String::new(), rest.to_string())
        }
    } else {
        (String::new(), rest.to_string())
    };
    let rest = rest.strip_prefix("**")?;
    let end = rest.find("**")?;
    let category = rest[..end].to_string();
    Some((glyph, category))
}

fn insert_into_completed(lines: &mut Vec<String>, item_desc: &str) {
    let Some(start) = lines.iter().position(|l| l.trim() == "## Completed") else { return };
    let mut insert_at = start + 1;
    for (offset, line) in lines[start + 1..].iter().enumerate() {
        if line.trim().is_empty() || line.starts_with("### ") {
            insert_at = start + 1 + offset;
            break;
        }
    }
    let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S");
    lines.insert(insert_at, format!("- ✅ **{timestamp}**: {item_desc}"));
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    async fn manager() -> (TodoManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let manager = TodoManager::new(dir.path()).unwrap();
        (manager, dir)
    }

    #[tokio::test]
    async fn create_todo_list_writes_three_sections() {
        let (mut manager, _dir) = manager().await;
        let rel = manager.create_todo_list("build a thing", Some("demo")).await.unwrap();
        assert!(rel.ends_with(".md"));
        let content = afs::read_to_string(manager.current_todo_file().unwrap()).await.unwrap();
        assert!(content.contains("## Pending"));
        assert!(content.contains("## Completed"));
        assert!(content.contains("## Records"));
    }

    #[tokio::test]
    async fn add_todo_item_inserts_after_pending_heading() {
        let (mut manager, _dir) = manager().await;
        manager.create_todo_list("task", Some("demo")).await.unwrap();
        manager.add_todo_item("fix the bug", Priority::High, "bugfix").await.unwrap();
        let content = afs::read_to_string(manager.current_todo_file().unwrap()).await.unwrap();
        let pending_idx = content.lines().position(|l| l.trim() == "## Pending").unwrap();
        let next_line = content.lines().nth(pending_idx + 1).unwrap();
        assert!(next_line.contains("fix the bug"));
    }

    #[tokio::test]
    async fn mark_todo_completed_moves_item_to_completed_section() {
        let (mut manager, _dir) = manager().await;
        manager.create_todo_list("task", Some("demo")).await.unwrap();
        let updated = manager.mark_todo_completed("Analyze requirements").await.unwrap();
        assert!(updated);
        let content = afs::read_to_string(manager.current_todo_file().unwrap()).await.unwrap();
        assert!(content.contains("- [x]"));
        let completed_idx = content.lines().position(|l| l.trim() == "## Completed").unwrap();
        let completed_section: Vec<&str> = content.lines().skip(completed_idx).collect();
        assert!(completed_section.iter().any(|l| l.contains("Analyze requirements")));
    }

    #[tokio::test]
    async fn records_are_capped_at_twenty() {
        let (mut manager, _dir) = manager().await;
        manager.create_todo_list("task", Some("demo")).await.unwrap();
        for i in 0..25 {
            manager.add_execution_record(&format!("record {i}")).await.unwrap();
        }
        let content = afs::read_to_string(manager.current_todo_file().unwrap()).await.unwrap();
        let records_idx = content.lines().position(|l| l.trim() == "## Records").unwrap();
        let record_lines: Vec<&str> = content.lines().skip(records_idx + 1).take_while(|l| l.trim_start().starts_with('-')).collect();
        assert_eq!(record_lines.len(), 20);
        assert!(record_lines[0].contains("record 24") || record_lines.iter().any(|l| l.contains("record 24")));
        assert!(!content.contains("record 0 "));
    }

    #[tokio::test]
    async fn get_todo_summary_counts_pending_and_completed() {
        let (mut manager, _dir) = manager().await;
        manager.create_todo_list("task", Some("demo")).await.unwrap();
        manager.mark_todo_completed("Analyze requirements").await.unwrap();
        let summary = manager.get_todo_summary().await.unwrap();
        assert_eq!(summary.completed_todos, 1);
        assert_eq!(summary.pending_todos, 2);
    }

    #[tokio::test]
    async fn no_active_list_yields_empty_summary() {
        let (manager, _dir) = manager().await;
        let summary = manager.get_todo_summary().await.unwrap();
        assert!(summary.empty);
    }
}
