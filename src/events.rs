//! 运行事件模块：向外部指标/告警系统发送结构化事件（发后即忘）。
//!
//! # Runtime Events
//!
//! The runtime reports what it does through an [`EventSink`] handed to each
//! component at construction. Sinks are fire-and-forget: a failing sink never
//! affects batch processing, and the runtime never waits on dashboards or alert routing.
//!
//! | Sink | Description |
//! |------|-------------|
//! | [`NoopEventSink`] | Default, drops everything |
//! | [`TracingEventSink`] | Forwards events to `tracing` |
//! | [`InMemoryEventSink`] | Bounded in-memory buffer for tests and inspection |
//! | [`ChannelEventSink`] | Pushes events into an unbounded tokio channel |
//! | [`CallbackEventSink`] | Invokes a registered closure |
//! | [`CompositeEventSink`] | Fans out to several sinks |

use crate::classify::ErrorCategory;
use crate::recovery::ConsistencyIssue;
use crate::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Structured runtime event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    RunStarted {
        processing_id: String,
        total_items: usize,
        resumed_at_item: Option<usize>,
    },
    BatchCompleted {
        processing_id: String,
        batch_index: usize,
        item_count: usize,
        elapsed_ms: u64,
    },
    BatchFailed {
        processing_id: String,
        batch_index: usize,
        item_count: usize,
        error: String,
        category: Option<ErrorCategory>,
    },
    RetryScheduled {
        operation: String,
        attempt: u32,
        delay_ms: u64,
        category: ErrorCategory,
    },
    BreakerOpened {
        operation: String,
        consecutive_failures: u32,
    },
    BreakerClosed {
        operation: String,
    },
    PoolExhausted {
        waited_ms: u64,
    },
    CheckpointSaved {
        processing_id: String,
        processed: usize,
        failed: usize,
        last_batch_index: Option<usize>,
    },
    ConsistencyIssueFound {
        issue: ConsistencyIssue,
    },
    RecoveryApplied {
        processing_id: String,
        batch_index: Option<usize>,
        strategy: String,
        outcome: String,
    },
    EscalationCreated {
        escalation_id: String,
        reason: String,
    },
    DeadLettered {
        operation: String,
        batch_index: Option<usize>,
        attempts: u32,
    },
    RunFinished {
        processing_id: String,
        processed: usize,
        failed: usize,
        total: usize,
        elapsed_ms: u64,
        cancelled: bool,
    },
}

impl RuntimeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeEvent::RunStarted { .. } => "run_started",
            RuntimeEvent::BatchCompleted { .. } => "batch_completed",
            RuntimeEvent::BatchFailed { .. } => "batch_failed",
            RuntimeEvent::RetryScheduled { .. } => "retry_scheduled",
            RuntimeEvent::BreakerOpened { .. } => "breaker_opened",
            RuntimeEvent::BreakerClosed { .. } => "breaker_closed",
            RuntimeEvent::PoolExhausted { .. } => "pool_exhausted",
            RuntimeEvent::CheckpointSaved { .. } => "checkpoint_saved",
            RuntimeEvent::ConsistencyIssueFound { .. } => "consistency_issue_found",
            RuntimeEvent::RecoveryApplied { .. } => "recovery_applied",
            RuntimeEvent::EscalationCreated { .. } => "escalation_created",
            RuntimeEvent::DeadLettered { .. } => "dead_lettered",
            RuntimeEvent::RunFinished { .. } => "run_finished",
        }
    }
}

/// Destination for runtime events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: RuntimeEvent) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Shared sink handle.
pub type SharedEventSink = Arc<dyn EventSink>;

/// Emit and ignore sink failures.
pub(crate) async fn emit(sink: &SharedEventSink, event: RuntimeEvent) {
    let kind = event.kind();
    if let Err(e) = sink.emit(event).await {
        tracing::debug!(event = kind, error = %e, "event sink rejected event");
    }
}

pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn emit(&self, _event: RuntimeEvent) -> Result<()> {
        Ok(())
    }
}

pub fn noop_sink() -> SharedEventSink {
    Arc::new(NoopEventSink)
}

/// Logs every event through `tracing`.
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: RuntimeEvent) -> Result<()> {
        match &event {
            RuntimeEvent::BatchFailed { .. }
            | RuntimeEvent::BreakerOpened { .. }
            | RuntimeEvent::ConsistencyIssueFound { .. }
            | RuntimeEvent::EscalationCreated { .. }
            | RuntimeEvent::DeadLettered { .. } => {
                tracing::warn!(event = event.kind(), payload = ?event, "runtime event")
            }
            _ => tracing::info!(event = event.kind(), payload = ?event, "runtime event"),
        }
        Ok(())
    }
}

/// In-memory sink for testing.
pub struct InMemoryEventSink {
    events: Arc<RwLock<Vec<RuntimeEvent>>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events: max,
        }
    }
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
    pub fn count_of(&self, kind: &str) -> usize {
        self.events
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }
    pub fn clear(&self) {
        self.events.write().unwrap_or_else(|p| p.into_inner()).clear();
    }
    pub fn len(&self) -> usize {
        self.events.read().unwrap_or_else(|p| p.into_inner()).len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn emit(&self, event: RuntimeEvent) -> Result<()> {
        let mut events = self.events.write().unwrap_or_else(|p| p.into_inner());
        events.push(event);
        if events.len() > self.max_events {
            events.remove(0);
        }
        Ok(())
    }
}

/// Channel sink: the receiver side is handed to whatever transport the caller runs.
pub struct ChannelEventSink {
    tx: mpsc::UnboundedSender<RuntimeEvent>,
}

impl ChannelEventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RuntimeEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelEventSink {
    async fn emit(&self, event: RuntimeEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| crate::Error::runtime("event channel closed"))
    }
}

/// Callback sink.
pub struct CallbackEventSink {
    callback: Box<dyn Fn(&RuntimeEvent) + Send + Sync>,
}

impl CallbackEventSink {
    pub fn new(callback: impl Fn(&RuntimeEvent) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl EventSink for CallbackEventSink {
    async fn emit(&self, event: RuntimeEvent) -> Result<()> {
        (self.callback)(&event);
        Ok(())
    }
}

/// Composite sink for multiple destinations.
pub struct CompositeEventSink {
    sinks: Vec<SharedEventSink>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }
    pub fn add_sink(mut self, sink: SharedEventSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Default for CompositeEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for CompositeEventSink {
    async fn emit(&self, event: RuntimeEvent) -> Result<()> {
        for s in &self.sinks {
            let _ = s.emit(event.clone()).await;
        }
        Ok(())
    }
    async fn close(&self) -> Result<()> {
        for s in &self.sinks {
            let _ = s.close().await;
        }
        Ok(())
    }
}
