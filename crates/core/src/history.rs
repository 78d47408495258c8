//! Conversation history store trait.
//!
//! Read once at invocation start, written once at the end; never touched
//! mid-loop. The engine fails open on both: a broken store degrades to no
//! history, never to a failed invocation.

use async_trait::async_trait;

use crate::command::Command;
use crate::error::StoreError;
use crate::message::Message;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    fn name(&self) -> &str;

    /// Prior messages for the command's conversation, oldest first.
    async fn load_history(&self, command: &Command) -> Result<Vec<Message>, StoreError>;

    /// Append the messages this invocation committed.
    async fn save_history(
        &self,
        command: &Command,
        messages: Vec<Message>,
    ) -> Result<(), StoreError>;
}
