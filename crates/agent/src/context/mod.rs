//! Context window management.
//!
//! [`token`] estimates message cost by character class; [`window`] trims a
//! message list to the budget left after the system prompt and the output
//! reserve, never splitting an assistant tool-call message from its results.

pub mod token;
pub mod window;

pub use token::{estimate_message_tokens, estimate_messages_tokens, estimate_tokens};
pub use window::{ContextWindow, TrimOutcome};
