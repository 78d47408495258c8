//! The reagent execution engine.
//!
//! An [`Engine`] drives one agent invocation through a bounded
//! **Reason → Act → Observe** loop:
//!
//! 1. **Admit** the command (concurrency permit, deadline, guard, hooks)
//! 2. **Trim** the conversation to the model's context window
//! 3. **Call** the model, retrying transient failures with backoff
//! 4. **If tool calls**: run them concurrently, append the results, go to 2
//! 5. **If text**: return it as the final answer
//!
//! Once the tool-call budget is spent the model is asked again with no
//! tools offered, so every invocation terminates. Failures come back as a
//! structured [`ExecutionResult`](reagent_core::ExecutionResult) carrying
//! an [`ErrorCode`](reagent_core::ErrorCode).

pub mod classify;
pub mod context;
pub mod engine;
pub mod loop_driver;
pub mod orchestrator;
pub mod retry;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use classify::{classify, classify_message, is_transient};
pub use context::{ContextWindow, TrimOutcome};
pub use engine::{error_marker, Engine, EngineBuilder};
pub use loop_driver::{LoopInput, LoopOutcome, LoopSettings, ReactLoop};
pub use orchestrator::{ExecutionAccounting, ToolOrchestrator};
pub use retry::{RetryController, RetryPolicy};
