//! C4 Session Store: persists Sessions as JSON files under
//! `<workdir>/.aacode/sessions/`, counts tokens, and triggers local
//! compaction when a Session's budget is exceeded. Grounded on the
//! teacher's `conversation_history.rs` for the keep-last-N collapsing
//! logic.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::fs as afs;

use crate::error::{AacodeErr, Result};
use crate::types::{Message, Role, Session, SessionStatus};

#[derive(Serialize, Deserialize, Default)]
struct SessionsIndex {
    sessions: HashMap<String, String>,
}

pub struct SessionStore {
    sessions_dir: PathBuf,
    max_tokens: usize,
    sessions: HashMap<String, Session>,
    counter: u64,
}

impl SessionStore {
    pub async fn new(workdir: impl Into<PathBuf>, max_tokens: usize) -> Result<Self> {
        let sessions_dir = workdir.into().join(".aacode").join("sessions");
        afs::create_dir_all(&sessions_dir).await?;
        Ok(Self {
            sessions_dir,
            max_tokens,
            sessions: HashMap::new(),
            counter: 0,
        })
    }

    fn next_id(&mut self) -> String {
        self.counter += 1;
        format!("{}-{}", Utc::now().timestamp(), self.counter)
    }

    /// Inserts a system preamble and the initial user task, then persists.
    pub async fn create_session(&mut self, system_preamble: &str, task: &str, title: Option<&str>) -> Result<String> {
        let id = self.next_id();
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            created_at: now,
            last_activity: now,
            title: title.unwrap_or(task).to_string(),
            status: SessionStatus::Active,
            messages: vec![Message::new(Role::System, system_preamble), Message::new(Role::User, task)],
            total_tokens: 0,
        };
        let mut session = session;
        session.total_tokens = session.total_tokens_recomputed();
        self.sessions.insert(id.clone(), session);
        self.persist(&id).await?;
        Ok(id)
    }

    /// Appends a message; if this would exceed `max_tokens`, first runs the
    /// local compaction routine (keep system + last 3 messages, summarize
    /// the rest into one line). Returns `false` if still over budget.
    pub async fn add_message(
        &mut self,
        session_id: &str,
        role: Role,
        content: &str,
        metadata: Option<HashMap<String, serde_json::Value>>,
    ) -> Result<bool> {
        let mut message = Message::new(role, content);
        if let Some(metadata) = metadata {
            message = message.with_metadata(metadata);
        }

        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AacodeErr::SessionNotFound(session_id.to_string()))?;

        let prospective = session.total_tokens + message.token_count;
        if prospective > self.max_tokens {
            compact_in_place(session);
        }

        let prospective = session.total_tokens_recomputed() + message.token_count;
        if prospective > self.max_tokens {
            self.persist(session_id).await?;
            return Ok(false);
        }

        session.messages.push(message);
        session.total_tokens = session.total_tokens_recomputed();
        session.last_activity = Utc::now();
        self.persist(session_id).await?;
        Ok(true)
    }

    /// Returns the messages of `session_id`, transparently loading from
    /// disk into the in-memory map if not already resident.
    pub async fn get_messages(&mut self, session_id: &str) -> Result<&[Message]> {
        if !self.sessions.contains_key(session_id) {
            self.load(session_id).await?;
        }
        Ok(&self
            .sessions
            .get(session_id)
            .ok_or_else(|| AacodeErr::SessionNotFound(session_id.to_string()))?
            .messages)
    }

    /// Truncates to the most recent `max_messages` non-system messages.
    pub async fn compress_session(&mut self, session_id: &str, max_messages: usize) -> Result<()> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| AacodeErr::SessionNotFound(session_id.to_string()))?;

        let (system, rest): (Vec<Message>, Vec<Message>) =
            session.messages.drain(..).partition(|m| matches!(m.role, Role::System));
        let mut kept = rest;
        if kept.len() > max_messages {
            let drop = kept.len() - max_messages;
            kept.drain(0..drop);
        }
        session.messages = system.into_iter().chain(kept).collect();
        session.total_tokens = session.total_tokens_recomputed();
        self.persist(session_id).await
    }

    pub async fn get_conversation_history(&mut self, session_id: &str, max_length: usize) -> Result<String> {
        let messages = self.get_messages(session_id).await?;
        let mut out = String::new();
        for message in messages {
            let line = format!("{:?}: {}\n", message.role, message.content);
            out.push_str(&line);
            if out.chars().count() >= max_length {
                out = out.chars().take(max_length).collect();
                break;
            }
        }
        Ok(out)
    }

    async fn persist(&mut self, session_id: &str) -> Result<()> {
        let session = self
            .sessions
            .get(session_id)
            .ok_or_else(|| AacodeErr::SessionNotFound(session_id.to_string()))?;
        let path = self.sessions_dir.join(format!("{session_id}.json"));
        let json = serde_json::to_string_pretty(session)?;
        afs::write(&path, json).await?;
        self.update_index(session_id).await
    }

    async fn update_index(&self, session_id: &str) -> Result<()> {
        let index_path = self.sessions_dir.join("sessions_index.json");
        let mut index: SessionsIndex = match afs::read_to_string(&index_path).await {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => SessionsIndex::default(),
        };
        index
            .sessions
            .insert(session_id.to_string(), format!("{session_id}.json"));
        afs::write(&index_path, serde_json::to_string_pretty(&index)?).await?;
        Ok(())
    }

    async fn load(&mut self, session_id: &str) -> Result<()> {
        let path = self.sessions_dir.join(format!("{session_id}.json"));
        let text = afs::read_to_string(&path).await?;
        let session: Session = serde_json::from_str(&text)?;
        self.sessions.insert(session_id.to_string(), session);
        Ok(())
    }
}

/// Keep the system message(s) and the last 3 messages; collapse whatever
/// is in between into one summary turn.
fn compact_in_place(session: &mut Session) {
    let system_count = session.messages.iter().take_while(|m| matches!(m.role, Role::System)).count();
    let total = session.messages.len();
    if total <= system_count + 3 {
        return;
    }

    let tail_start = total - 3;
    let middle: Vec<&Message> = session.messages[system_count..tail_start].iter().collect();
    if middle.is_empty() {
        return;
    }
    let summary_text = format!("[compacted {} earlier messages]", middle.len());

    let mut rebuilt: Vec<Message> = session.messages[..system_count].to_vec();
    rebuilt.push(Message::new(Role::System, summary_text));
    rebuilt.extend(session.messages[tail_start..].iter().cloned());
    session.messages = rebuilt;
    session.total_tokens = session.total_tokens_recomputed();
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[tokio::test]
    async fn create_session_has_system_and_task() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::new(dir.path(), 200_000).await.unwrap();
        let id = store.create_session("system prompt", "do the task", None).await.unwrap();
        let messages = store.get_messages(&id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].role, Role::System));
    }

    #[tokio::test]
    async fn add_message_stays_under_max_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::new(dir.path(), 200_000).await.unwrap();
        let id = store.create_session("sys", "task", None).await.unwrap();
        store.add_message(&id, Role::Assistant, "hello", None).await.unwrap();
        let messages = store.get_messages(&id).await.unwrap();
        let total: usize = messages.iter().map(|m| m.token_count).sum();
        assert!(total <= 200_000);
    }

    #[tokio::test]
    async fn add_message_over_budget_triggers_compaction() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::new(dir.path(), 20).await.unwrap();
        let id = store.create_session("sys", "task", None).await.unwrap();
        for i in 0..10 {
            store.add_message(&id, Role::Assistant, &format!("message number {i}"), None).await.unwrap();
        }
        let messages = store.get_messages(&id).await.unwrap();
        assert!(messages.iter().any(|m| m.content.starts_with("[compacted")));
    }

    #[tokio::test]
    async fn compress_session_truncates_non_system_messages() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::new(dir.path(), 200_000).await.unwrap();
        let id = store.create_session("sys", "task", None).await.unwrap();
        for i in 0..10 {
            store.add_message(&id, Role::Assistant, &format!("msg {i}"), None).await.unwrap();
        }
        store.compress_session(&id, 3).await.unwrap();
        let messages = store.get_messages(&id).await.unwrap();
        let non_system = messages.iter().filter(|m| !matches!(m.role, Role::System)).count();
        assert_eq!(non_system, 3);
    }

    #[tokio::test]
    async fn session_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let mut store = SessionStore::new(dir.path(), 200_000).await.unwrap();
            store.create_session("sys", "task", None).await.unwrap()
        };
        let mut store = SessionStore::new(dir.path(), 200_000).await.unwrap();
        let messages = store.get_messages(&id).await.unwrap();
        assert_eq!(messages.len(), 2);
    }

    #[tokio::test]
    async fn conversation_history_truncation_does_not_panic_on_multibyte_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SessionStore::new(dir.path(), 200_000).await.unwrap();
        let id = store.create_session("sys", "任务", None).await.unwrap();
        for _ in 0..5 {
            store.add_message(&id, Role::Assistant, "错误 失败 警告 repeated multibyte content", None).await.unwrap();
        }
        let history = store.get_conversation_history(&id, 37).await.unwrap();
        assert!(history.chars().count() <= 37);
    }
}
