//! Shared test helpers: a scripted provider and a few deterministic tools.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reagent_core::error::{ProviderError, ToolError};
use reagent_core::message::{Message, MessageToolCall};
use reagent_core::provider::{
    ChunkReceiver, Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage,
};
use reagent_core::tool::Tool;
use tokio::sync::mpsc;

/// One scripted step of a [`ScriptedProvider`].
pub enum Step {
    Reply(ProviderResponse),
    Fail(ProviderError),
    /// Stream `partial` and then fail; `complete` just fails.
    BreakMidStream { partial: String, error: ProviderError },
    /// Stream `partial` and then go silent until the consumer hangs up;
    /// `complete` never returns.
    Hang { partial: String },
}

/// A mock provider that plays back a script, one step per model call.
///
/// Every request is recorded so tests can inspect what the model was offered.
/// Calls past the end of the script fail with `InvalidResponse`.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(responses: Vec<ProviderResponse>) -> Self {
        Self::new(responses.into_iter().map(Step::Reply).collect())
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_step(&self, request: ProviderRequest) -> Option<Step> {
        self.requests.lock().unwrap().push(request);
        self.steps.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted_mock"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        match self.next_step(request) {
            Some(Step::Reply(response)) => Ok(response),
            Some(Step::Fail(error)) | Some(Step::BreakMidStream { error, .. }) => Err(error),
            Some(Step::Hang { .. }) => std::future::pending().await,
            None => Err(ProviderError::InvalidResponse("script exhausted".into())),
        }
    }

    async fn stream(&self, request: ProviderRequest) -> Result<ChunkReceiver, ProviderError> {
        let step = self.next_step(request);
        let (tx, rx) = mpsc::channel(32);
        match step {
            Some(Step::Reply(response)) => {
                tokio::spawn(async move {
                    // One delta per word, tool calls and usage in the final chunk.
                    for word in response.message.content.split_inclusive(' ') {
                        let chunk = StreamChunk {
                            content: Some(word.to_string()),
                            ..StreamChunk::default()
                        };
                        if tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx
                        .send(Ok(StreamChunk {
                            content: None,
                            tool_calls: response.message.tool_calls,
                            done: true,
                            usage: response.usage,
                        }))
                        .await;
                });
            }
            Some(Step::BreakMidStream { partial, error }) => {
                tokio::spawn(async move {
                    let chunk = StreamChunk {
                        content: Some(partial),
                        ..StreamChunk::default()
                    };
                    if tx.send(Ok(chunk)).await.is_ok() {
                        let _ = tx.send(Err(error)).await;
                    }
                });
            }
            Some(Step::Hang { partial }) => {
                tokio::spawn(async move {
                    let chunk = StreamChunk {
                        content: Some(partial),
                        ..StreamChunk::default()
                    };
                    if tx.send(Ok(chunk)).await.is_ok() {
                        tx.closed().await;
                    }
                });
            }
            Some(Step::Fail(error)) => return Err(error),
            None => return Err(ProviderError::InvalidResponse("script exhausted".into())),
        }
        Ok(rx)
    }
}

pub fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

/// A final-answer response (no tool calls).
pub fn text_response(text: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant(text),
        usage: Some(usage()),
        model: "mock-model".into(),
    }
}

/// A response requesting tool calls, with optional thought text.
pub fn tool_call_response(calls: Vec<MessageToolCall>, thought: &str) -> ProviderResponse {
    ProviderResponse {
        message: Message::assistant_with_tool_calls(thought, calls),
        usage: Some(usage()),
        model: "mock-model".into(),
    }
}

pub fn call(id: &str, name: &str, arguments: &str) -> MessageToolCall {
    MessageToolCall::new(id, name, arguments)
}

/// Canned weather by city; fails without a `city` argument.
pub struct WeatherTool;

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "weather"
    }

    fn description(&self) -> &str {
        "Current weather for a city"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "city": { "type": "string" } },
            "required": ["city"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let city = arguments["city"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("missing 'city'".into()))?;
        Ok(match city {
            "Seoul" => "Sunny, 22C".into(),
            "Busan" => "Cloudy, 18C".into(),
            other => format!("No data for {other}"),
        })
    }
}

/// Sleeps for `ms` milliseconds, then reports it.
pub struct SleepTool;

#[async_trait]
impl Tool for SleepTool {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleeps for a number of milliseconds"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "ms": { "type": "integer" } }
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let ms = arguments["ms"].as_u64().unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(format!("slept {ms}ms"))
    }
}

/// Always panics.
pub struct PanicTool;

#[async_trait]
impl Tool for PanicTool {
    fn name(&self) -> &str {
        "panic"
    }

    fn description(&self) -> &str {
        "Panics"
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({ "type": "object" })
    }

    async fn execute(&self, _arguments: serde_json::Value) -> Result<String, ToolError> {
        panic!("tool bug");
    }
}
