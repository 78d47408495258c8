//! The ReAct loop driver.
//!
//! One invocation cycles through
//! `Trimming → Calling → Inspecting → {ToolExecuting → Trimming} | Done`:
//!
//! 1. **Trim** the accumulated messages to the context window
//! 2. **Call** the model through the retry controller
//! 3. **Inspect** the reply: no tool calls (or no tools offered) ends the loop
//! 4. **Execute** the requested tools, append the round, go back to 1
//!
//! Once the invocation's tool-call budget is spent, the next model call is
//! offered no tools, so the loop makes at most `max_tool_calls + 1` model
//! calls. Any error ends the loop; the partial transcript is discarded.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use reagent_core::error::Error;
use reagent_core::event::{DomainEvent, MetricsSink};
use reagent_core::hook::HookContext;
use reagent_core::message::{Message, MessageToolCall};
use reagent_core::provider::{Provider, ProviderRequest, Usage};
use reagent_core::tool::ToolSet;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::ContextWindow;
use crate::orchestrator::{ExecutionAccounting, ToolOrchestrator};
use crate::retry::RetryController;

/// Model parameters resolved for one invocation.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: Option<u32>,
    pub response_format: Option<String>,
    /// Tool-call budget for the whole invocation
    pub max_tool_calls: u32,
}

/// Everything one run of the loop needs.
pub struct LoopInput {
    pub system_prompt: String,
    /// Prior conversation, oldest first
    pub history: Vec<Message>,
    /// The current user turn
    pub user_message: Message,
    pub tools: ToolSet,
    pub hook_context: Arc<HookContext>,
}

/// A finished loop.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    /// Text of the final model turn
    pub answer: String,
    /// Messages appended during this invocation, starting with the user turn
    pub transcript: Vec<Message>,
    pub usage: Usage,
    pub tools_used: Vec<String>,
    /// Tool-call requests counted, including refused ones
    pub tool_calls: u32,
    /// Model calls made
    pub iterations: u32,
}

/// One model turn, however it was delivered.
struct Turn {
    text: String,
    tool_calls: Vec<MessageToolCall>,
    usage: Option<Usage>,
    model: String,
}

pub struct ReactLoop {
    provider: Arc<dyn Provider>,
    window: ContextWindow,
    retry: RetryController,
    orchestrator: ToolOrchestrator,
    settings: LoopSettings,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl ReactLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        window: ContextWindow,
        retry: RetryController,
        orchestrator: ToolOrchestrator,
        settings: LoopSettings,
    ) -> Self {
        Self {
            provider,
            window,
            retry,
            orchestrator,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run to completion.
    ///
    /// With `deltas`, model turns are streamed and each content delta is
    /// forwarded as it arrives. A delta, once sent, is never retracted even
    /// if the loop later fails.
    pub async fn run(
        &self,
        input: LoopInput,
        cancel: &CancellationToken,
        deltas: Option<&mpsc::Sender<String>>,
    ) -> Result<LoopOutcome, Error> {
        let LoopInput {
            system_prompt,
            history,
            user_message,
            tools,
            hook_context,
        } = input;

        let accounting = Arc::new(ExecutionAccounting::new(self.settings.max_tool_calls));
        let turn_start = history.len();
        let mut messages = history;
        messages.push(user_message);

        let mut usage = Usage::default();
        let mut iterations = 0u32;

        info!(
            model = %self.settings.model,
            history = turn_start,
            tools = tools.len(),
            streaming = deltas.is_some(),
            "Starting ReAct loop"
        );

        loop {
            iterations += 1;

            let offer_tools = !tools.is_empty() && !accounting.limit_reached();
            if !tools.is_empty() && !offer_tools {
                warn!(
                    calls = accounting.calls_made(),
                    max = accounting.max_calls(),
                    "Tool-call budget spent, requesting a final answer without tools"
                );
            }

            let trimmed = self.window.trim_with_report(&messages, &system_prompt);
            if !trimmed.fits() {
                warn!(
                    tokens = trimmed.tokens,
                    budget = trimmed.budget,
                    "Current turn alone exceeds the context budget"
                );
            }

            debug!(
                iteration = iterations,
                messages = trimmed.messages.len(),
                offer_tools,
                "Loop iteration"
            );

            let request = ProviderRequest {
                model: self.settings.model.clone(),
                system: system_prompt.clone(),
                messages: trimmed.messages,
                temperature: self.settings.temperature,
                max_tokens: self.settings.max_output_tokens,
                tools: if offer_tools { tools.definitions() } else { Vec::new() },
                response_format: self.settings.response_format.clone(),
                stream: deltas.is_some(),
            };

            let started = Instant::now();
            let turn = match deltas {
                Some(tx) => self.streamed_turn(request, tx, cancel).await?,
                None => self.complete_turn(request, cancel).await?,
            };

            if let Some(u) = &turn.usage {
                usage.accumulate(u);
            }
            self.record(DomainEvent::ResponseGenerated {
                model: turn.model.clone(),
                tokens_used: turn.usage.map(|u| u.total_tokens).unwrap_or(0),
                duration_ms: started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            });

            if !offer_tools || turn.tool_calls.is_empty() {
                if !turn.tool_calls.is_empty() {
                    debug!(
                        ignored = turn.tool_calls.len(),
                        "Ignoring tool calls in a turn that offered no tools"
                    );
                }
                messages.push(Message::assistant(turn.text.clone()));
                info!(
                    iterations,
                    tool_calls = accounting.calls_made(),
                    tokens = usage.total_tokens,
                    "ReAct loop finished"
                );
                return Ok(LoopOutcome {
                    answer: turn.text,
                    transcript: messages.split_off(turn_start),
                    usage,
                    tools_used: accounting.tools_used(),
                    tool_calls: accounting.calls_made(),
                    iterations,
                });
            }

            debug!(count = turn.tool_calls.len(), "Model requested tools");
            messages.push(Message::assistant_with_tool_calls(
                turn.text,
                turn.tool_calls.clone(),
            ));

            let results = self
                .orchestrator
                .execute_all(&turn.tool_calls, &tools, &accounting, &hook_context, cancel)
                .await?;

            messages.extend(
                results
                    .into_iter()
                    .map(|r| Message::tool_result(r.call_id, r.output)),
            );
        }
    }

    async fn complete_turn(
        &self,
        request: ProviderRequest,
        cancel: &CancellationToken,
    ) -> Result<Turn, Error> {
        let response = self
            .retry
            .call(cancel, || self.provider.complete(request.clone()))
            .await?;

        Ok(Turn {
            text: response.message.content,
            tool_calls: response.message.tool_calls,
            usage: response.usage,
            model: response.model,
        })
    }

    /// Stream one turn. Only establishing the stream is retried: after the
    /// first delta has gone out, a failure ends the loop.
    async fn streamed_turn(
        &self,
        request: ProviderRequest,
        tx: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<Turn, Error> {
        let model = request.model.clone();
        let mut rx = self
            .retry
            .call(cancel, || self.provider.stream(request.clone()))
            .await?;

        let mut turn = Turn {
            text: String::new(),
            tool_calls: Vec::new(),
            usage: None,
            model,
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = rx.recv() => next,
            };

            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!(error = %e, "Model stream failed mid-turn");
                    return Err(e.into());
                }
            };

            if let Some(delta) = chunk.content.filter(|d| !d.is_empty()) {
                turn.text.push_str(&delta);
                if tx.send(delta).await.is_err() {
                    debug!("Stream consumer went away");
                    return Err(Error::Cancelled);
                }
            }
            turn.tool_calls.extend(chunk.tool_calls);
            if chunk.usage.is_some() {
                turn.usage = chunk.usage;
            }
            if chunk.done {
                break;
            }
        }

        Ok(turn)
    }

    fn record(&self, event: DomainEvent) {
        if let Some(metrics) = &self.metrics {
            metrics.record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::test_helpers::*;
    use reagent_core::error::ProviderError;
    use reagent_core::message::Role;
    use reagent_core::tool::Tool;

    fn settings(max_tool_calls: u32) -> LoopSettings {
        LoopSettings {
            model: "mock-model".into(),
            temperature: 0.2,
            max_output_tokens: Some(256),
            response_format: None,
            max_tool_calls,
        }
    }

    fn react_loop(provider: Arc<ScriptedProvider>, max_tool_calls: u32) -> ReactLoop {
        ReactLoop::new(
            provider,
            ContextWindow::new(128_000, 4096),
            RetryController::new(RetryPolicy::none()),
            ToolOrchestrator::default(),
            settings(max_tool_calls),
        )
    }

    fn input(prompt: &str, tools: ToolSet) -> LoopInput {
        LoopInput {
            system_prompt: "You are a helpful assistant.".into(),
            history: Vec::new(),
            user_message: Message::user(prompt),
            tools,
            hook_context: Arc::new(HookContext::default()),
        }
    }

    fn weather() -> ToolSet {
        ToolSet::from_tools([Arc::new(WeatherTool) as Arc<dyn Tool>])
    }

    #[tokio::test]
    async fn plain_answer_ends_after_one_call() {
        let provider = Arc::new(ScriptedProvider::replies(vec![text_response("Paris.")]));
        let outcome = react_loop(provider.clone(), 10)
            .run(input("Capital of France?", ToolSet::new()), &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(outcome.answer, "Paris.");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.transcript.len(), 2);
        assert_eq!(outcome.transcript[0].role, Role::User);
        assert_eq!(outcome.usage.total_tokens, 15);
        assert!(provider.requests()[0].tools.is_empty());
    }

    #[tokio::test]
    async fn tool_round_is_appended_as_a_unit() {
        let provider = Arc::new(ScriptedProvider::replies(vec![
            tool_call_response(vec![call("c1", "weather", r#"{"city":"Seoul"}"#)], "Checking."),
            text_response("It is sunny in Seoul."),
        ]));
        let outcome = react_loop(provider.clone(), 10)
            .run(input("Weather in Seoul?", weather()), &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(outcome.answer, "It is sunny in Seoul.");
        assert_eq!(outcome.tools_used, vec!["weather".to_string()]);
        assert_eq!(outcome.tool_calls, 1);
        assert_eq!(outcome.usage.total_tokens, 30);

        let requests = provider.requests();

        let second = &requests[1];
        let n = second.messages.len();
        assert!(second.messages[n - 2].has_tool_calls());
        assert_eq!(second.messages[n - 1].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(second.messages[n - 1].content, "Sunny, 22C");
        assert_eq!(outcome.transcript.len(), 4);
    }

    #[tokio::test]
    async fn spent_budget_withholds_tools() {
        let provider = Arc::new(ScriptedProvider::replies(vec![
            tool_call_response(vec![call("c1", "weather", r#"{"city":"Seoul"}"#)], ""),
            tool_call_response(vec![call("c2", "weather", r#"{"city":"Busan"}"#)], ""),
            tool_call_response(vec![call("c3", "weather", r#"{"city":"Seoul"}"#)], "Enough."),
        ]));
        let outcome = react_loop(provider.clone(), 2)
            .run(input("Loop forever", weather()), &CancellationToken::new(), None)
            .await
            .unwrap();

        let requests = provider.requests();
        assert_eq!(requests.len(), 3);
        assert!(!requests[0].tools.is_empty());
        assert!(!requests[1].tools.is_empty());
        assert!(requests[2].tools.is_empty());
        assert_eq!(outcome.answer, "Enough.");
        assert_eq!(outcome.tool_calls, 2);
        assert!(!outcome.transcript.last().unwrap().has_tool_calls());
    }

    #[tokio::test]
    async fn zero_budget_never_offers_tools() {
        let provider = Arc::new(ScriptedProvider::replies(vec![text_response("No tools.")]));
        let outcome = react_loop(provider.clone(), 0)
            .run(input("hi", weather()), &CancellationToken::new(), None)
            .await
            .unwrap();

        assert!(provider.requests()[0].tools.is_empty());
        assert_eq!(outcome.answer, "No tools.");
    }

    #[tokio::test]
    async fn history_is_trimmed_before_each_call() {
        let provider = Arc::new(ScriptedProvider::replies(vec![text_response("ok")]));
        let react = ReactLoop::new(
            provider.clone(),
            ContextWindow::new(300, 50),
            RetryController::new(RetryPolicy::none()),
            ToolOrchestrator::default(),
            settings(10),
        );
        let mut run_input = input("current question", ToolSet::new());
        run_input.history = (0..20)
            .map(|i| Message::user(format!("old message {i} {}", "x".repeat(200))))
            .collect();

        let outcome = react.run(run_input, &CancellationToken::new(), None).await.unwrap();

        let requests = provider.requests();

        let sent = &requests[0].messages;
        assert!(sent.len() < 21);
        assert_eq!(sent.last().unwrap().content, "current question");
        // transcript only covers this invocation
        assert_eq!(outcome.transcript.len(), 2);
    }

    #[tokio::test]
    async fn failure_discards_progress() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::Reply(tool_call_response(vec![call("c1", "weather", r#"{"city":"Seoul"}"#)], "")),
            Step::Fail(ProviderError::AuthenticationFailed("revoked".into())),
        ]));
        let err = react_loop(provider, 10)
            .run(input("Weather?", weather()), &CancellationToken::new(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provider(ProviderError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn streaming_forwards_deltas() {
        let provider = Arc::new(ScriptedProvider::replies(vec![
            tool_call_response(
                vec![call("c1", "weather", r#"{"city":"Busan"}"#)],
                "Let me check. ",
            ),
            text_response("Cloudy in Busan."),
        ]));
        let (tx, mut rx) = mpsc::channel(64);

        let outcome = react_loop(provider, 10)
            .run(input("Weather in Busan?", weather()), &CancellationToken::new(), Some(&tx))
            .await
            .unwrap();
        drop(tx);

        let mut streamed = String::new();
        while let Some(delta) = rx.recv().await {
            streamed.push_str(&delta);
        }
        assert_eq!(streamed, "Let me check. Cloudy in Busan.");
        assert_eq!(outcome.answer, "Cloudy in Busan.");
        assert_eq!(outcome.tools_used, vec!["weather".to_string()]);
        assert_eq!(outcome.usage.total_tokens, 30);
    }

    #[tokio::test]
    async fn mid_stream_failure_is_not_retried() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::BreakMidStream {
                partial: "Half an ans".into(),
                error: ProviderError::StreamInterrupted("connection reset".into()),
            },
            Step::Reply(text_response("never reached")),
        ]));
        let react = ReactLoop::new(
            provider.clone(),
            ContextWindow::new(128_000, 4096),
            RetryController::new(RetryPolicy {
                max_attempts: 3,
                ..RetryPolicy::none()
            }),
            ToolOrchestrator::default(),
            settings(10),
        );
        let (tx, mut rx) = mpsc::channel(8);

        let err = react
            .run(input("hi", ToolSet::new()), &CancellationToken::new(), Some(&tx))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provider(ProviderError::StreamInterrupted(_))));
        assert_eq!(provider.call_count(), 1);
        assert_eq!(rx.recv().await.as_deref(), Some("Half an ans"));
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_calling() {
        let provider = Arc::new(ScriptedProvider::replies(vec![text_response("late")]));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = react_loop(provider.clone(), 10)
            .run(input("hi", ToolSet::new()), &cancel, None)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(provider.call_count(), 0);
    }
}
