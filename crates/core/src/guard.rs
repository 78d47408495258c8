//! Guard trait: the pre-execution approval gate.
//!
//! Consulted once per command before anything else runs. The engine fails
//! closed: a guard that errors is treated as a rejection.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::error::GuardError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GuardDecision {
    Allow,
    Reject { reason: String, category: String },
}

#[async_trait]
pub trait Guard: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, command: &Command) -> Result<GuardDecision, GuardError>;
}

/// A guard that approves everything.
pub struct AllowAll;

#[async_trait]
impl Guard for AllowAll {
    fn name(&self) -> &str {
        "allow_all"
    }

    async fn check(&self, _command: &Command) -> Result<GuardDecision, GuardError> {
        Ok(GuardDecision::Allow)
    }
}
