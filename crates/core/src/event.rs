//! Domain events and the metrics sink they are recorded through.
//!
//! The engine records execution, tool-call and retry events. Recording is
//! fire-and-forget: a sink must never block or fail the invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::ErrorCode;

/// All domain events the engine emits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A model call returned
    ResponseGenerated {
        model: String,
        tokens_used: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A transient model-call failure will be retried after `delay_ms`
    RetryScheduled {
        attempt: u32,
        delay_ms: u64,
        error_message: String,
        timestamp: DateTime<Utc>,
    },

    /// An invocation finished, successfully or not
    ExecutionCompleted {
        success: bool,
        error_code: Option<ErrorCode>,
        tool_calls: u32,
        tokens_used: u32,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

/// Fire-and-forget recorder for [`DomainEvent`]s.
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: DomainEvent);
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub. Slow
/// subscribers lag and lose events; publishers never wait.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl MetricsSink for EventBus {
    fn record(&self, event: DomainEvent) {
        self.publish(event);
    }
}
