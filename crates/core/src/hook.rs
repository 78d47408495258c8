//! Lifecycle hooks: ordered, short-circuiting interceptors.
//!
//! Four points: before-start, before-tool-call, after-tool-call,
//! after-complete. Before-* hooks return a [`HookAction`]; the first one
//! that is not `Continue` wins and the remaining hooks at that point are
//! skipped. After-* hooks are best effort.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::command::ExecutionResult;
use crate::error::HookError;
use crate::tool::{ToolCall, ToolResult};

/// What a before-* hook wants to happen next.
#[derive(Debug, Clone, PartialEq)]
pub enum HookAction {
    Continue,
    Reject { reason: String },
    /// Replace the arguments (tool call) or the user prompt (start, when a string)
    Modify { arguments: serde_json::Value },
    /// An out-of-band approval is required; treated as a refusal for now.
    PendingApproval { reason: String },
}

/// Invocation-scoped data every hook sees.
#[derive(Debug, Clone, Default)]
pub struct HookContext {
    pub user_prompt: String,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    async fn before_start(&self, _ctx: &HookContext) -> Result<HookAction, HookError> {
        Ok(HookAction::Continue)
    }

    async fn before_tool_call(
        &self,
        _ctx: &HookContext,
        _call: &ToolCall,
    ) -> Result<HookAction, HookError> {
        Ok(HookAction::Continue)
    }

    async fn after_tool_call(
        &self,
        _ctx: &HookContext,
        _call: &ToolCall,
        _result: &ToolResult,
    ) -> Result<(), HookError> {
        Ok(())
    }

    async fn after_complete(
        &self,
        _ctx: &HookContext,
        _result: &ExecutionResult,
    ) -> Result<(), HookError> {
        Ok(())
    }
}

/// Runs registered hooks in registration order.
#[derive(Clone, Default)]
pub struct HookExecutor {
    hooks: Vec<Arc<dyn Hook>>,
}

impl HookExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub async fn before_start(&self, ctx: &HookContext) -> Result<HookAction, HookError> {
        for hook in &self.hooks {
            let action = hook.before_start(ctx).await?;
            if action != HookAction::Continue {
                return Ok(action);
            }
        }
        Ok(HookAction::Continue)
    }

    pub async fn before_tool_call(
        &self,
        ctx: &HookContext,
        call: &ToolCall,
    ) -> Result<HookAction, HookError> {
        for hook in &self.hooks {
            let action = hook.before_tool_call(ctx, call).await?;
            if action != HookAction::Continue {
                return Ok(action);
            }
        }
        Ok(HookAction::Continue)
    }

    /// Failures are logged and do not stop later hooks.
    pub async fn after_tool_call(&self, ctx: &HookContext, call: &ToolCall, result: &ToolResult) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_tool_call(ctx, call, result).await {
                warn!(
                    hook = hook.name(),
                    tool = %call.name,
                    error = %e,
                    "after_tool_call hook failed"
                );
            }
        }
    }

    pub async fn after_complete(&self, ctx: &HookContext, result: &ExecutionResult) {
        for hook in &self.hooks {
            if let Err(e) = hook.after_complete(ctx, result).await {
                warn!(hook = hook.name(), error = %e, "after_complete hook failed");
            }
        }
    }
}
