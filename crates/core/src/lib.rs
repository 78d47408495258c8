//! # reagent core
//!
//! Domain types, collaborator traits, and error definitions for the
//! reagent ReAct execution engine. This crate has no engine logic: it
//! defines the vocabulary the engine and its collaborators share.
//!
//! ## Design Philosophy
//!
//! Every collaborator (model endpoint, tools, guard, hooks, history store,
//! retriever, metrics) is a trait here. Implementations live elsewhere.
//! This enables:
//! - Swapping implementations without touching the loop
//! - Easy testing with scripted mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod command;
pub mod error;
pub mod event;
pub mod guard;
pub mod history;
pub mod hook;
pub mod message;
pub mod provider;
pub mod retrieval;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use command::{Command, CommandOptions, ExecutionError, ExecutionResult, SESSION_ID_KEY};
pub use error::{Error, ErrorCode, ProviderError, Result, ToolError};
pub use event::{DomainEvent, EventBus, MetricsSink};
pub use guard::{AllowAll, Guard, GuardDecision};
pub use history::ConversationStore;
pub use hook::{Hook, HookAction, HookContext, HookExecutor};
pub use message::{Message, MessageToolCall, Role};
pub use provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, ToolDefinition, Usage,
};
pub use retrieval::Retriever;
pub use tool::{Tool, ToolCall, ToolResult, ToolSet};
