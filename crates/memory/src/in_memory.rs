//! In-memory store: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use reagent_core::command::Command;
use reagent_core::error::StoreError;
use reagent_core::history::ConversationStore;
use reagent_core::message::Message;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Keeps each session's messages in a map keyed by the command's
/// `session_id` metadata.
pub struct InMemoryStore {
    sessions: Arc<RwLock<HashMap<String, Vec<Message>>>>,
    /// Keep at most this many messages per session (oldest dropped)
    max_messages: Option<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_messages: None,
        }
    }

    /// Cap each session at `max` messages.
    pub fn with_max_messages(mut self, max: usize) -> Self {
        self.max_messages = Some(max);
        self
    }

    pub async fn session_len(&self, session_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|m| m.len())
            .unwrap_or(0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn name(&self) -> &str { "in_memory" }

    async fn load_history(&self, command: &Command) -> Result<Vec<Message>, StoreError> {
        let session = command.session_id().ok_or(StoreError::MissingSession)?;
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session).cloned().unwrap_or_default())
    }

    async fn save_history(
        &self,
        command: &Command,
        messages: Vec<Message>,
    ) -> Result<(), StoreError> {
        let session = command.session_id().ok_or(StoreError::MissingSession)?;
        let mut sessions = self.sessions.write().await;
        let entry = sessions.entry(session.to_string()).or_default();
        entry.extend(messages);

        if let Some(max) = self.max_messages {
            if entry.len() > max {
                let excess = entry.len() - max;
                entry.drain(..excess);
            }
        }
        debug!(session_id = session, len = entry.len(), "Saved conversation history");
        Ok(())
    }
}
