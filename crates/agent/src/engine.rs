//! Entry-point dispatcher.
//!
//! [`Engine`] is the one long-lived object: it owns the collaborators and
//! the concurrency permit pool. Each `execute*` call is an independent
//! invocation that:
//!
//! 1. Waits for a permit (bounded concurrency)
//! 2. Consults the guard, then the before-start hooks
//! 3. Loads history and retrieved context
//! 4. Runs the ReAct loop
//! 5. Saves history, runs after-complete hooks, records metrics
//!
//! Steps 1–4 and the history save share one overall deadline. Failures
//! never escape as `Err`: they come back as an [`ExecutionResult`] with an
//! [`ErrorCode`], or, when streaming, as a final in-band error marker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reagent_config::{EngineConfig, MAX_EXECUTION_TIMEOUT_SECS};
use reagent_core::command::{Command, ExecutionResult};
use reagent_core::error::{Error, ErrorCode};
use reagent_core::event::{DomainEvent, MetricsSink};
use reagent_core::guard::{Guard, GuardDecision};
use reagent_core::history::ConversationStore;
use reagent_core::hook::{Hook, HookAction, HookContext, HookExecutor};
use reagent_core::message::Message;
use reagent_core::provider::Provider;
use reagent_core::retrieval::Retriever;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::classify;
use crate::context::ContextWindow;
use crate::loop_driver::{LoopInput, LoopOutcome, LoopSettings, ReactLoop};
use crate::orchestrator::ToolOrchestrator;
use crate::retry::{RetryController, RetryPolicy};

/// Buffered deltas per streaming invocation.
const STREAM_BUFFER: usize = 64;

/// Render the in-band marker that ends a failed stream.
pub fn error_marker(code: ErrorCode, message: &str) -> String {
    format!("[ERROR {code}] {message}")
}

struct EngineInner {
    provider: Arc<dyn Provider>,
    config: EngineConfig,
    timeout: Duration,
    permits: Arc<Semaphore>,
    guard: Option<Arc<dyn Guard>>,
    hooks: HookExecutor,
    store: Option<Arc<dyn ConversationStore>>,
    retriever: Option<Arc<dyn Retriever>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

/// The execution engine. Cheap to clone; clones share the permit pool.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

/// Builder for [`Engine`].
pub struct EngineBuilder {
    provider: Arc<dyn Provider>,
    config: EngineConfig,
    timeout: Option<Duration>,
    guard: Option<Arc<dyn Guard>>,
    hooks: HookExecutor,
    store: Option<Arc<dyn ConversationStore>>,
    retriever: Option<Arc<dyn Retriever>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl EngineBuilder {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            config: EngineConfig::default(),
            timeout: None,
            guard: None,
            hooks: HookExecutor::new(),
            store: None,
            retriever: None,
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Overall deadline per invocation, overriding `execution_timeout_secs`.
    /// Capped like the config value.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_guard(mut self, guard: Arc<dyn Guard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Hooks run in the order they are added.
    pub fn with_hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.register(hook);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Builds even from a config that fails validation; out-of-range values
    /// are clamped where they are used.
    pub fn build(self) -> Engine {
        if let Err(e) = self.config.validate() {
            warn!(error = %e, "Engine config failed validation, clamping out-of-range values");
        }
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_executions.max(1)));
        let timeout = self
            .timeout
            .unwrap_or_else(|| self.config.execution_timeout())
            .min(Duration::from_secs(MAX_EXECUTION_TIMEOUT_SECS));
        Engine {
            inner: Arc::new(EngineInner {
                provider: self.provider,
                config: self.config,
                timeout,
                permits,
                guard: self.guard,
                hooks: self.hooks,
                store: self.store,
                retriever: self.retriever,
                metrics: self.metrics,
            }),
        }
    }
}

impl Engine {
    pub fn builder(provider: Arc<dyn Provider>) -> EngineBuilder {
        EngineBuilder::new(provider)
    }

    pub fn new(provider: Arc<dyn Provider>, config: EngineConfig) -> Self {
        EngineBuilder::new(provider).with_config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Run one command to completion.
    pub async fn execute(&self, command: Command) -> ExecutionResult {
        self.drive(command, CancellationToken::new(), None).await
    }

    /// Like [`execute`](Self::execute); cancelling `cancel` stops the run at
    /// its next suspension point.
    pub async fn execute_with_cancellation(
        &self,
        command: Command,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        self.drive(command, cancel, None).await
    }

    /// Run one command, streaming content deltas.
    ///
    /// The run happens on a spawned task, so this must be called from
    /// within a Tokio runtime. On failure the last item is
    /// `[ERROR <CODE>] <message>`; deltas already yielded stay yielded.
    /// Dropping the stream cancels the run.
    pub fn execute_streaming(&self, command: Command) -> ReceiverStream<String> {
        self.execute_streaming_with_cancellation(command, CancellationToken::new())
    }

    pub fn execute_streaming_with_cancellation(
        &self,
        command: Command,
        cancel: CancellationToken,
    ) -> ReceiverStream<String> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let engine = self.clone();

        tokio::spawn(async move {
            let drive = engine.drive(command, cancel.clone(), Some(tx.clone()));
            tokio::pin!(drive);
            let finished = tokio::select! {
                result = &mut drive => Some(result),
                _ = tx.closed() => None,
            };
            let result = match finished {
                Some(result) => result,
                None => {
                    debug!("Stream dropped by consumer, cancelling run");
                    cancel.cancel();
                    drive.await
                }
            };
            if let Some(error) = &result.error {
                let _ = tx.send(error_marker(error.code, &error.message)).await;
            }
        });

        ReceiverStream::new(rx)
    }

    async fn drive(
        &self,
        command: Command,
        parent: CancellationToken,
        deltas: Option<mpsc::Sender<String>>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let timeout = self.inner.timeout;
        let deadline = started
            .checked_add(timeout)
            .unwrap_or_else(|| started + Duration::from_secs(MAX_EXECUTION_TIMEOUT_SECS));
        let cancel = parent.child_token();

        info!(
            session_id = command.session_id().unwrap_or("-"),
            tools = command.tools.len(),
            streaming = deltas.is_some(),
            "Executing command"
        );

        let run = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                outcome = self.run(&command, &cancel, deltas.as_ref()) => outcome,
            }
        };

        let mut tool_calls = 0;
        let result = match tokio::time::timeout_at(deadline, run).await {
            Ok(Ok(outcome)) => {
                tool_calls = outcome.tool_calls;
                ExecutionResult {
                    success: true,
                    content: Some(outcome.answer),
                    tools_used: outcome.tools_used,
                    usage: outcome.usage,
                    duration: started.elapsed(),
                    messages: outcome.transcript,
                    error: None,
                }
            }
            Ok(Err(error)) => failure(&error, started.elapsed()),
            Err(_) => {
                cancel.cancel();
                warn!(timeout_ms = timeout.as_millis() as u64, "Execution deadline exceeded");
                ExecutionResult::failure(
                    ErrorCode::Timeout,
                    format!("Execution timed out after {timeout:?}"),
                    started.elapsed(),
                )
            }
        };

        let ctx = HookContext {
            user_prompt: command.user_prompt.clone(),
            metadata: command.metadata.clone(),
        };
        let after = self.inner.hooks.after_complete(&ctx, &result);
        if tokio::time::timeout_at(deadline.max(Instant::now() + AFTER_HOOK_GRACE), after)
            .await
            .is_err()
        {
            warn!("after_complete hooks did not finish in time");
        }

        self.record(DomainEvent::ExecutionCompleted {
            success: result.success,
            error_code: result.error_code(),
            tool_calls,
            tokens_used: result.usage.total_tokens,
            duration_ms: result.duration.as_millis() as u64,
            timestamp: Utc::now(),
        });

        match &result.error {
            None => info!(
                duration_ms = result.duration.as_millis() as u64,
                tokens = result.usage.total_tokens,
                tools_used = result.tools_used.len(),
                "Command completed"
            ),
            Some(e) => warn!(code = %e.code, error = %e.message, "Command failed"),
        }

        result
    }

    async fn run(
        &self,
        command: &Command,
        cancel: &CancellationToken,
        deltas: Option<&mpsc::Sender<String>>,
    ) -> Result<LoopOutcome, Error> {
        let _permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("execution permit pool closed".into()))?;

        self.check_guard(command).await?;

        let mut ctx = HookContext {
            user_prompt: command.user_prompt.clone(),
            metadata: command.metadata.clone(),
        };
        match self.inner.hooks.before_start(&ctx).await {
            Ok(HookAction::Continue) => {}
            Ok(HookAction::Modify { arguments }) => match arguments {
                serde_json::Value::String(prompt) => {
                    debug!("before_start hook replaced the user prompt");
                    ctx.user_prompt = prompt;
                }
                other => debug!(value = %other, "Ignoring non-string before_start modification"),
            },
            Ok(HookAction::Reject { reason }) => {
                return Err(Error::Rejected {
                    reason,
                    category: "hook".into(),
                });
            }
            Ok(HookAction::PendingApproval { reason }) => {
                return Err(Error::Rejected {
                    reason: format!("approval pending: {reason}"),
                    category: "approval".into(),
                });
            }
            Err(e) => {
                warn!(error = %e, "before_start hook failed, rejecting command");
                return Err(Error::Rejected {
                    reason: e.to_string(),
                    category: "hook".into(),
                });
            }
        }

        let history = self.load_history(command).await;
        let system_prompt = self
            .augment_system_prompt(&command.system_prompt, &ctx.user_prompt)
            .await;
        let user_message = Message::user(ctx.user_prompt.clone());

        let outcome = self
            .react_loop(command)
            .run(
                LoopInput {
                    system_prompt,
                    history,
                    user_message,
                    tools: command.tools.clone(),
                    hook_context: Arc::new(ctx),
                },
                cancel,
                deltas,
            )
            .await?;

        self.save_history(command, &outcome).await;
        Ok(outcome)
    }

    /// Guard errors fail closed.
    async fn check_guard(&self, command: &Command) -> Result<(), Error> {
        let Some(guard) = &self.inner.guard else {
            return Ok(());
        };
        match guard.check(command).await {
            Ok(GuardDecision::Allow) => Ok(()),
            Ok(GuardDecision::Reject { reason, category }) => {
                info!(guard = guard.name(), %category, %reason, "Command rejected by guard");
                Err(Error::Rejected { reason, category })
            }
            Err(e) => {
                warn!(guard = guard.name(), error = %e, "Guard failed, rejecting command");
                Err(Error::Rejected {
                    reason: e.to_string(),
                    category: "guard_unavailable".into(),
                })
            }
        }
    }

    /// History carried on the command wins; otherwise ask the store.
    async fn load_history(&self, command: &Command) -> Vec<Message> {
        if !command.history.is_empty() {
            return command.history.clone();
        }
        let Some(store) = &self.inner.store else {
            return Vec::new();
        };
        match store.load_history(command).await {
            Ok(history) => {
                debug!(store = store.name(), messages = history.len(), "Loaded history");
                history
            }
            Err(e) => {
                warn!(
                    store = store.name(),
                    error = %e,
                    "History load failed, continuing without it"
                );
                Vec::new()
            }
        }
    }

    /// Commits the user turn and the final answer.
    async fn save_history(&self, command: &Command, outcome: &LoopOutcome) {
        let Some(store) = &self.inner.store else {
            return;
        };
        let transcript = &outcome.transcript;
        let committed: Vec<Message> = match (transcript.first(), transcript.last()) {
            (Some(user), Some(answer)) => vec![user.clone(), answer.clone()],
            _ => return,
        };
        if let Err(e) = store.save_history(command, committed).await {
            warn!(store = store.name(), error = %e, "History save failed");
        }
    }

    async fn augment_system_prompt(&self, system_prompt: &str, query: &str) -> String {
        let rag = &self.inner.config.rag;
        let Some(retriever) = self.inner.retriever.as_ref().filter(|_| rag.enabled) else {
            return system_prompt.to_string();
        };
        match retriever.retrieve(query).await {
            Ok(context) if !context.trim().is_empty() => {
                debug!(retriever = retriever.name(), chars = context.len(), "Retrieved context");
                format!("{system_prompt}\n\n{}\n{context}", rag.header)
            }
            Ok(_) => system_prompt.to_string(),
            Err(e) => {
                warn!(
                    retriever = retriever.name(),
                    error = %e,
                    "Retrieval failed, continuing without context"
                );
                system_prompt.to_string()
            }
        }
    }

    fn react_loop(&self, command: &Command) -> ReactLoop {
        let config = &self.inner.config;
        let options = &command.options;
        let max_output_tokens = options
            .max_output_tokens
            .unwrap_or(config.context.max_output_tokens);

        let window = ContextWindow::from_config(&config.context)
            .with_output_reserve(max_output_tokens as usize);
        let mut retry = RetryController::new(RetryPolicy::from_config(&config.retry));
        let mut orchestrator = ToolOrchestrator::new(self.inner.hooks.clone());
        if let Some(metrics) = &self.inner.metrics {
            retry = retry.with_metrics(metrics.clone());
            orchestrator = orchestrator.with_metrics(metrics.clone());
        }

        let settings = LoopSettings {
            model: options
                .model
                .clone()
                .unwrap_or_else(|| config.default_model.clone()),
            temperature: options.temperature.unwrap_or(config.default_temperature),
            max_output_tokens: Some(max_output_tokens),
            response_format: options.response_format.clone(),
            max_tool_calls: config.react.max_tool_calls,
        };

        let react = ReactLoop::new(
            self.inner.provider.clone(),
            window,
            retry,
            orchestrator,
            settings,
        );
        match &self.inner.metrics {
            Some(metrics) => react.with_metrics(metrics.clone()),
            None => react,
        }
    }

    fn record(&self, event: DomainEvent) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.record(event);
        }
    }
}

/// Extra time after-complete hooks get once the deadline has passed.
const AFTER_HOOK_GRACE: Duration = Duration::from_secs(1);

fn failure(error: &Error, duration: Duration) -> ExecutionResult {
    if error.is_cancelled() {
        return ExecutionResult::failure(ErrorCode::Unknown, "execution cancelled", duration);
    }
    ExecutionResult::failure(classify(error), error.to_string(), duration)
}
