//! Unified event bus — trait for emitting engine events from any module.
//!
//! The engine accepts an `Arc<dyn EventSink>` and emits one event per
//! meaningful enrollment mutation, so reporting and audit pipelines can
//! observe journeys without reaching into engine state.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Everything the engine reports about a funnel journey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    EnrollmentCreated,
    StepCompleted,
    MessageDispatched,
    ActionExecuted,
    ConditionMet,
    RetryScheduled,
    RetryExhausted,
    VariantAssigned,
    GoalConverted,
    EnrollmentCompleted,
    EnrollmentExited,
    EnrollmentPaused,
    EnrollmentResumed,
}

/// One engine event, keyed back to the funnel/enrollment/step it describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub funnel_id: Uuid,
    pub enrollment_id: Uuid,
    pub subscriber_id: Uuid,
    pub step_id: Option<Uuid>,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Trait for emitting engine events. Implementations route events to
/// analytics storage, message queues, or customer webhooks.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: FunnelEvent);
}

/// No-op sink for tests and embedders that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: FunnelEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<FunnelEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<FunnelEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: FunnelEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for creating a `FunnelEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    funnel_id: Uuid,
    enrollment_id: Uuid,
    subscriber_id: Uuid,
    step_id: Option<Uuid>,
    detail: serde_json::Value,
) -> FunnelEvent {
    FunnelEvent {
        event_id: Uuid::new_v4(),
        event_type,
        funnel_id,
        enrollment_id,
        subscriber_id,
        step_id,
        detail,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for embedders that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
