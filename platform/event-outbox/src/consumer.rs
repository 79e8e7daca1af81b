//! Delivery consumers the dispatcher fans each envelope out to
//!
//! A consumer receives every claimed envelope exactly once per delivery
//! attempt and must be idempotent: at-least-once delivery means the same
//! envelope can arrive again after a crash or a failed sibling consumer.
//!
//! Built-ins:
//! - [`CacheInvalidator`]: evicts affected read-model cache entries (the
//!   reason the outbox exists)
//! - [`AuditTrail`]: appends a structured audit record per event
//! - [`IntegrationRelay`]: republishes the envelope to an external bus for
//!   other systems

use crate::envelope::{validate_envelope_fields, OutboxEnvelope};
use crate::error::{OutboxError, OutboxResult};
use crate::serializer::SnapshotSerializer;
use async_trait::async_trait;
use cache_registry::{CacheKeyRegistry, ProjectionCache};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

/// One downstream handler of delivered envelopes
#[async_trait]
pub trait EventConsumer: Send + Sync {
    /// Stable name used in logs and error context
    fn name(&self) -> &'static str;

    /// Process one envelope; must be safe to call again with the same one
    async fn handle(&self, envelope: &OutboxEnvelope) -> OutboxResult<()>;
}

impl fmt::Debug for dyn EventConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventConsumer({})", self.name())
    }
}

// ============================================================================
// CACHE INVALIDATION
// ============================================================================

/// Evicts the cached projections an envelope's change affects
///
/// Resolution goes through the registry (entity type + every identifier in
/// the payload), eviction goes to the projection cache, and successfully
/// evicted keys are unregistered. Evicting an already-absent key is a no-op,
/// so redelivery never fails here.
pub struct CacheInvalidator {
    registry: Arc<CacheKeyRegistry>,
    cache: Arc<dyn ProjectionCache>,
}

impl CacheInvalidator {
    pub fn new(registry: Arc<CacheKeyRegistry>, cache: Arc<dyn ProjectionCache>) -> Self {
        Self { registry, cache }
    }
}

#[async_trait]
impl EventConsumer for CacheInvalidator {
    fn name(&self) -> &'static str {
        "cache_invalidator"
    }

    async fn handle(&self, envelope: &OutboxEnvelope) -> OutboxResult<()> {
        let identifiers = envelope.affected_identifiers();
        let affected = self.registry.resolve(&envelope.entity_type, &identifiers);

        if affected.is_empty() {
            tracing::debug!(
                event_id = %envelope.event_id,
                entity_type = %envelope.entity_type,
                "No cached projections affected"
            );
            return Ok(());
        }

        for key in &affected {
            // Evict first, unregister second: a failure in between leaves the
            // key registered, which only means a redundant re-eviction later
            self.cache.evict(key).await?;
            self.registry.unregister(key);
        }

        tracing::debug!(
            event_id = %envelope.event_id,
            entity_type = %envelope.entity_type,
            evicted = affected.len(),
            "Evicted affected cache keys"
        );

        Ok(())
    }
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// One line of the audit trail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecord {
    pub event_id: crate::event_id::EventId,
    pub tenant_id: String,
    pub user_id: Option<String>,
    pub entity_type: String,
    pub entity_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
}

impl AuditRecord {
    fn from_envelope(envelope: &OutboxEnvelope) -> Self {
        Self {
            event_id: envelope.event_id,
            tenant_id: envelope.tenant_id.clone(),
            user_id: envelope.user_id.clone(),
            entity_type: envelope.entity_type.clone(),
            entity_id: envelope.entity_id.clone(),
            event_type: envelope.event_type.clone(),
            occurred_at: envelope.occurred_at,
        }
    }
}

/// Destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> OutboxResult<()>;
}

/// Default sink: a structured log record on the `audit` target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: AuditRecord) -> OutboxResult<()> {
        tracing::info!(
            target: "audit",
            event_id = %record.event_id,
            tenant_id = %record.tenant_id,
            user_id = record.user_id.as_deref().unwrap_or("system"),
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            event_type = %record.event_type,
            occurred_at = %record.occurred_at,
            "Domain event delivered"
        );
        Ok(())
    }
}

/// Test sink that keeps every record in memory
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: std::sync::Mutex<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("audit lock poisoned").clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, record: AuditRecord) -> OutboxResult<()> {
        self.records.lock().expect("audit lock poisoned").push(record);
        Ok(())
    }
}

/// Appends an audit record for every delivered envelope
pub struct AuditTrail {
    sink: Arc<dyn AuditSink>,
}

impl AuditTrail {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl EventConsumer for AuditTrail {
    fn name(&self) -> &'static str {
        "audit_trail"
    }

    async fn handle(&self, envelope: &OutboxEnvelope) -> OutboxResult<()> {
        self.sink.record(AuditRecord::from_envelope(envelope)).await
    }
}

// ============================================================================
// INTEGRATION RELAY
// ============================================================================

/// External message bus the relay publishes to
#[async_trait]
pub trait IntegrationBus: Send + Sync {
    /// Publish a serialized envelope to a subject
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> OutboxResult<()>;
}

impl fmt::Debug for dyn IntegrationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IntegrationBus")
    }
}

/// A message observed on the in-memory bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub payload: Vec<u8>,
}

/// IntegrationBus implementation using in-memory broadcast channels
///
/// Suitable for tests and local development: subscribers receive every
/// message published after they subscribed, in publish order.
#[derive(Clone)]
pub struct InMemoryIntegrationBus {
    sender: broadcast::Sender<BusMessage>,
}

impl InMemoryIntegrationBus {
    /// Create a bus buffering up to 1000 undelivered messages per subscriber
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        Self { sender }
    }

    /// Observe messages published after this call
    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.sender.subscribe()
    }
}

impl Default for InMemoryIntegrationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IntegrationBus for InMemoryIntegrationBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> OutboxResult<()> {
        // No receivers is fine: the relay's job ends at publication
        let _ = self.sender.send(BusMessage {
            subject: subject.to_string(),
            payload,
        });
        Ok(())
    }
}

/// IntegrationBus implementation over a NATS client
#[derive(Clone)]
pub struct NatsIntegrationBus {
    client: async_nats::Client,
}

impl NatsIntegrationBus {
    pub fn new(client: async_nats::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IntegrationBus for NatsIntegrationBus {
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> OutboxResult<()> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| OutboxError::TransientDelivery(format!("nats publish failed: {e}")))
    }
}

/// Republishes delivered envelopes to an external bus
///
/// Subjects follow `compliance.events.{entity}.{action}` in lowercase
/// (`compliance.events.asset.created`), so downstream systems can subscribe
/// with NATS wildcards per entity kind or across the board.
pub struct IntegrationRelay {
    bus: Arc<dyn IntegrationBus>,
    serializer: SnapshotSerializer,
}

impl IntegrationRelay {
    pub fn new(bus: Arc<dyn IntegrationBus>, serializer: SnapshotSerializer) -> Self {
        Self { bus, serializer }
    }

    /// Bus subject for an envelope
    pub fn subject(envelope: &OutboxEnvelope) -> String {
        let action = envelope
            .event_type
            .strip_prefix(&envelope.entity_type)
            .unwrap_or(&envelope.event_type);
        format!(
            "compliance.events.{}.{}",
            envelope.entity_type.to_lowercase(),
            action.to_lowercase()
        )
    }
}

#[async_trait]
impl EventConsumer for IntegrationRelay {
    fn name(&self) -> &'static str {
        "integration_relay"
    }

    async fn handle(&self, envelope: &OutboxEnvelope) -> OutboxResult<()> {
        let subject = Self::subject(envelope);
        let document = self.serializer.to_payload(envelope)?;
        // A malformed envelope must never reach downstream subscribers
        validate_envelope_fields(&document).map_err(OutboxError::Serialization)?;
        let payload = serde_json::to_vec(&document)?;

        self.bus.publish(&subject, payload).await?;

        tracing::debug!(
            event_id = %envelope.event_id,
            subject = %subject,
            "Envelope relayed to integration bus"
        );

        Ok(())
    }
}
