//! Session store: per-conversation history with a sliding window
//!
//! Each session holds at most [`SESSION_WINDOW`] messages. When an append
//! pushes it past the window, the oldest half collapses into a single
//! `system` message summarizing one line per dropped message.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::providers::{ChatMessage, ChatRole};

pub const SESSION_WINDOW: usize = 20;

const SUMMARY_HEADER: &str = "[Earlier conversation summary]";
const SUMMARY_LINE_CHARS: usize = 80;

/// A single conversation
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    fn new(id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            messages: Vec::new(),
            created_at,
        }
    }

    fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        if self.messages.len() > SESSION_WINDOW {
            self.compact();
        }
    }

    /// Collapse the oldest half into one summary message
    fn compact(&mut self) {
        let half = self.messages.len() / 2;
        let dropped: Vec<ChatMessage> = self.messages.drain(..half).collect();

        let mut summary = String::from(SUMMARY_HEADER);
        for msg in &dropped {
            let head: String = msg.content.chars().take(SUMMARY_LINE_CHARS).collect();
            summary.push_str(&format!("\n[{}] {}", msg.role, head));
        }

        self.messages.insert(0, ChatMessage::system(summary));
        debug!(
            "Session '{}' compacted {} messages (now {})",
            self.id,
            dropped.len(),
            self.messages.len()
        );
    }
}

/// Manages all active sessions
///
/// Writers to the same session are serialized by that session's lock;
/// different sessions never block each other beyond the map lookup.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clock,
        }
    }

    async fn entry(&self, session_id: &str) -> Arc<Mutex<Session>> {
        if let Some(existing) = self.sessions.read().await.get(session_id) {
            return existing.clone();
        }
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                info!("Created session '{}'", session_id);
                Arc::new(Mutex::new(Session::new(session_id, self.clock.now())))
            })
            .clone()
    }

    /// Append a message, creating the session on first use
    pub async fn add_message(&self, session_id: &str, role: ChatRole, content: impl Into<String>) {
        let session = self.entry(session_id).await;
        session.lock().await.push(ChatMessage::new(role, content));
    }

    /// The session's messages, optionally preceded by a system prompt that is not persisted
    pub async fn get_chat_messages(
        &self,
        session_id: &str,
        system_prompt: Option<&str>,
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            messages.push(ChatMessage::system(prompt));
        }
        let session = self.sessions.read().await.get(session_id).cloned();
        if let Some(session) = session {
            messages.extend(session.lock().await.messages.iter().cloned());
        }
        messages
    }

    /// Snapshot of a session, if it exists
    pub async fn session(&self, session_id: &str) -> Option<Session> {
        let session = self.sessions.read().await.get(session_id).cloned()?;
        let snapshot = session.lock().await.clone();
        Some(snapshot)
    }

    /// Remove a session. Returns whether it existed.
    pub async fn clear_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        if removed {
            info!("Cleared session '{}'", session_id);
        }
        removed
    }

    /// Number of active sessions
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
