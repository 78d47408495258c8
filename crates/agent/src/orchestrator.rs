//! Tool call orchestration.
//!
//! Every tool call of one model turn runs concurrently on a `JoinSet`;
//! results come back in request order regardless of completion order.
//! Ordinary tool failures become failed [`ToolResult`]s so siblings keep
//! running. A task that panics is a defect: the round is aborted and the
//! fault propagates.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use reagent_core::error::{Error, ToolError};
use reagent_core::event::{DomainEvent, MetricsSink};
use reagent_core::hook::{HookAction, HookContext, HookExecutor};
use reagent_core::message::MessageToolCall;
use reagent_core::tool::{ToolCall, ToolResult, ToolSet};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-invocation tool accounting, shared by that invocation's concurrent
/// tool calls and nothing else.
#[derive(Debug)]
pub struct ExecutionAccounting {
    calls: AtomicU32,
    max_calls: u32,
    tools_used: Mutex<Vec<String>>,
}

impl ExecutionAccounting {
    pub fn new(max_calls: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            max_calls,
            tools_used: Mutex::new(Vec::new()),
        }
    }

    /// Count one call attempt; returns the new total.
    pub fn record_call(&self) -> u32 {
        self.calls.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn calls_made(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_calls(&self) -> u32 {
        self.max_calls
    }

    /// Once true, the loop stops offering tools to the model.
    pub fn limit_reached(&self) -> bool {
        self.calls_made() >= self.max_calls
    }

    /// Record a tool that actually executed. Keeps first-use order, no duplicates.
    pub fn mark_used(&self, name: &str) {
        let mut used = self.tools_used.lock().unwrap_or_else(|e| e.into_inner());
        if !used.iter().any(|n| n == name) {
            used.push(name.to_string());
        }
    }

    pub fn tools_used(&self) -> Vec<String> {
        self.tools_used
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Runs one round of model-requested tool calls.
#[derive(Clone, Default)]
pub struct ToolOrchestrator {
    hooks: HookExecutor,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ToolOrchestrator {
    pub fn new(hooks: HookExecutor) -> Self {
        Self {
            hooks,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Execute every request concurrently; one result per request, in order.
    ///
    /// Cancelling `cancel` aborts all in-flight calls and yields
    /// `Error::Cancelled`.
    pub async fn execute_all(
        &self,
        requests: &[MessageToolCall],
        tools: &ToolSet,
        accounting: &Arc<ExecutionAccounting>,
        ctx: &Arc<HookContext>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ToolResult>, Error> {
        let round = cancel.child_token();
        let mut set = JoinSet::new();

        debug!(count = requests.len(), "Executing tool round");

        for (idx, request) in requests.iter().cloned().enumerate() {
            let this = self.clone();
            let tools = tools.clone();
            let accounting = accounting.clone();
            let ctx = ctx.clone();
            let token = round.clone();

            set.spawn(async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => (idx, None),
                    result = this.execute_one(request, &tools, &accounting, &ctx) => {
                        (idx, Some(result))
                    }
                }
            });
        }

        let mut results: Vec<Option<ToolResult>> = vec![None; requests.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, Some(result))) => results[idx] = Some(result),
                Ok((_, None)) => {
                    set.abort_all();
                    return Err(Error::Cancelled);
                }
                Err(join_err) if join_err.is_panic() => {
                    warn!(error = %join_err, "Tool task panicked, aborting round");
                    round.cancel();
                    set.abort_all();
                    return Err(Error::Tool(ToolError::Fault(join_err.to_string())));
                }
                Err(_) => {
                    set.abort_all();
                    return Err(Error::Cancelled);
                }
            }
        }

        results
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| Error::Internal("tool round finished with missing results".into()))
    }

    async fn execute_one(
        &self,
        request: MessageToolCall,
        tools: &ToolSet,
        accounting: &ExecutionAccounting,
        ctx: &HookContext,
    ) -> ToolResult {
        let count = accounting.record_call();
        if count > accounting.max_calls() {
            warn!(
                tool = %request.name,
                count,
                max = accounting.max_calls(),
                "Tool call limit exceeded"
            );
            return ToolResult::error(
                &request.id,
                format!(
                    "Tool call limit reached ({}); '{}' was not executed",
                    accounting.max_calls(),
                    request.name
                ),
            );
        }

        let arguments = if request.arguments.trim().is_empty() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str(&request.arguments) {
                Ok(v) => v,
                Err(e) => {
                    let error = ToolError::InvalidArguments(format!("'{}': {e}", request.name));
                    return ToolResult::error(&request.id, error.to_string());
                }
            }
        };

        let mut call = ToolCall {
            id: request.id,
            name: request.name,
            arguments,
        };

        match self.hooks.before_tool_call(ctx, &call).await {
            Ok(HookAction::Continue) => {}
            Ok(HookAction::Modify { arguments }) => {
                debug!(tool = %call.name, "Hook modified tool arguments");
                call.arguments = arguments;
            }
            Ok(HookAction::Reject { reason }) => {
                let error = ToolError::PermissionDenied {
                    tool_name: call.name.clone(),
                    reason,
                };
                return ToolResult::error(&call.id, error.to_string());
            }
            Ok(HookAction::PendingApproval { reason }) => {
                let error = ToolError::PermissionDenied {
                    tool_name: call.name.clone(),
                    reason: format!("pending approval: {reason}"),
                };
                return ToolResult::error(&call.id, error.to_string());
            }
            Err(e) => {
                warn!(tool = %call.name, error = %e, "before_tool_call hook failed, blocking call");
                return ToolResult::error(
                    &call.id,
                    format!("Tool call '{}' blocked: {e}", call.name),
                );
            }
        }

        let Some(tool) = tools.get(&call.name) else {
            warn!(tool = %call.name, "Model requested an unknown tool");
            let error = ToolError::NotFound(call.name.clone());
            return ToolResult::error(&call.id, error.to_string());
        };

        let start = Instant::now();
        let outcome = tool.execute(call.arguments.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        accounting.mark_used(&call.name);

        let result = match outcome {
            Ok(output) => ToolResult::success(&call.id, output),
            Err(e) => {
                warn!(tool = %call.name, error = %e, "Tool execution failed");
                ToolResult::error(&call.id, format!("Error: {e}"))
            }
        };

        self.hooks.after_tool_call(ctx, &call, &result).await;

        if let Some(metrics) = &self.metrics {
            metrics.record(DomainEvent::ToolExecuted {
                tool_name: call.name.clone(),
                success: result.success,
                duration_ms,
                timestamp: Utc::now(),
            });
        }

        result
    }
}
