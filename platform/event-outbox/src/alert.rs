//! Operational alerting for deliveries that keep failing
//!
//! Envelopes are never dropped or parked in a dead-letter table: the outbox
//! is append-only and at-least-once delivery keeps retrying on every sweep.
//! Once an envelope's attempt count reaches the configured budget the
//! dispatcher raises an alert through this hook so an operator can intervene.

use crate::envelope::OutboxEnvelope;
use crate::error::OutboxError;
use async_trait::async_trait;

/// Channel the dispatcher surfaces retry-budget exhaustion on
#[async_trait]
pub trait AlertHook: Send + Sync {
    /// Raise an alert for an envelope whose attempts reached the budget
    async fn raise(&self, envelope: &OutboxEnvelope, attempts: u32, error: &OutboxError);
}

/// Default hook: an error-level structured log record
///
/// Log-based alerting is enough when the deployment already routes
/// error-level records to an alert channel.
#[derive(Debug, Default)]
pub struct TracingAlert;

#[async_trait]
impl AlertHook for TracingAlert {
    async fn raise(&self, envelope: &OutboxEnvelope, attempts: u32, error: &OutboxError) {
        tracing::error!(
            event_id = %envelope.event_id,
            tenant_id = %envelope.tenant_id,
            event_type = %envelope.event_type,
            entity_id = %envelope.entity_id,
            attempts = attempts,
            error = %error,
            "Delivery retry budget exhausted, envelope remains pending"
        );
    }
}

/// Test hook that records every raised alert
#[derive(Debug, Default)]
pub struct RecordingAlert {
    raised: std::sync::Mutex<Vec<RaisedAlert>>,
}

/// One captured alert
#[derive(Debug, Clone)]
pub struct RaisedAlert {
    pub event_id: crate::event_id::EventId,
    pub attempts: u32,
    pub error: String,
}

impl RecordingAlert {
    pub fn new() -> Self {
        Self::default()
    }

    /// All alerts raised so far
    pub fn raised(&self) -> Vec<RaisedAlert> {
        self.raised.lock().expect("alert lock poisoned").clone()
    }
}

#[async_trait]
impl AlertHook for RecordingAlert {
    async fn raise(&self, envelope: &OutboxEnvelope, attempts: u32, error: &OutboxError) {
        self.raised
            .lock()
            .expect("alert lock poisoned")
            .push(RaisedAlert {
                event_id: envelope.event_id,
                attempts,
                error: error.to_string(),
            });
    }
}
