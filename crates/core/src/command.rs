//! Command (engine input) and ExecutionResult (engine output).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::message::Message;
use crate::provider::Usage;
use crate::tool::ToolSet;

/// Metadata key collaborators use to find the conversation.
pub const SESSION_ID_KEY: &str = "session_id";

/// Per-command model options. Unset fields fall back to engine config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    /// Output format hint (e.g. "json")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
}

/// One agent invocation request. Owned by the caller, never mutated.
#[derive(Debug, Clone, Default)]
pub struct Command {
    pub system_prompt: String,
    pub user_prompt: String,
    pub options: CommandOptions,
    /// Prior conversation, oldest first
    pub history: Vec<Message>,
    pub tools: ToolSet,
    /// Opaque key/value pairs for collaborators (session id, tenant, ...)
    pub metadata: HashMap<String, String>,
}

impl Command {
    pub fn new(system_prompt: impl Into<String>, user_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_tools(mut self, tools: ToolSet) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_options(mut self, options: CommandOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn session_id(&self) -> Option<&str> {
        self.metadata.get(SESSION_ID_KEY).map(|s| s.as_str())
    }
}

/// Why an invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub code: ErrorCode,
    /// Original message, preserved for diagnostics
    pub message: String,
}

/// The structured outcome of one invocation. Failures never escape as `Err`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,

    /// Final answer; `None` on failure
    pub content: Option<String>,

    /// Tools actually executed, in first-use order
    pub tools_used: Vec<String>,

    /// Token usage summed over every model call of the invocation
    pub usage: Usage,

    pub duration: Duration,

    /// Messages appended during this invocation (user turn, tool rounds,
    /// final answer). Empty on failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    pub fn failure(code: ErrorCode, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            content: None,
            tools_used: Vec::new(),
            usage: Usage::default(),
            duration,
            messages: Vec::new(),
            error: Some(ExecutionError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_builder_sets_metadata() {
        let cmd = Command::new("be brief", "capital of France?")
            .with_metadata(SESSION_ID_KEY, "s-1");
        assert_eq!(cmd.session_id(), Some("s-1"));
        assert!(cmd.tools.is_empty());
        assert!(cmd.history.is_empty());
    }

    #[test]
    fn failure_result_has_no_content() {
        let result =
            ExecutionResult::failure(ErrorCode::Timeout, "deadline", Duration::from_millis(5));
        assert!(!result.success);
        assert!(result.content.is_none());
        assert_eq!(result.error_code(), Some(ErrorCode::Timeout));
    }

    #[test]
    fn failure_result_serializes_code() {
        let result = ExecutionResult::failure(ErrorCode::RateLimited, "429", Duration::ZERO);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("RATE_LIMITED"));
    }
}
