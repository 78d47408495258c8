//! No-op store: disables conversation history entirely.

use async_trait::async_trait;
use reagent_core::command::Command;
use reagent_core::error::StoreError;
use reagent_core::history::ConversationStore;
use reagent_core::message::Message;

/// A store that remembers nothing.
pub struct NoopStore;

#[async_trait]
impl ConversationStore for NoopStore {
    fn name(&self) -> &str { "none" }

    async fn load_history(&self, _command: &Command) -> Result<Vec<Message>, StoreError> {
        Ok(Vec::new())
    }

    async fn save_history(
        &self,
        _command: &Command,
        _messages: Vec<Message>,
    ) -> Result<(), StoreError> {
        Ok(())
    }
}
