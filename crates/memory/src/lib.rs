//! Conversation history stores for reagent.

pub mod in_memory;
pub mod noop;

pub use in_memory::InMemoryStore;
pub use noop::NoopStore;
