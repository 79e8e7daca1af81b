//! # Transactional Outbox
//!
//! Event durability and cache coherence for the compliance back office:
//! every aggregate mutation produces an [`OutboxEnvelope`] that is persisted
//! atomically with the change, delivered at-least-once by the [`Dispatcher`],
//! and used to evict exactly the cached read-model entries the change affects.
//!
//! ## Why This Lives in Tier 1
//!
//! Every module that mutates a tracked aggregate appends envelopes; one
//! worker module delivers them. Placing the outbox in `platform/` (Tier 1)
//! allows:
//! - Producer modules to append without depending on the dispatcher
//! - Config-driven swap between Postgres (production) and InMemory (dev/test)
//!   stores, mirroring the bus split
//! - Consumers (cache invalidation, audit, integration relay) to plug in
//!   without producers knowing they exist
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cache_registry::{CacheKeyRegistry, InMemoryCache};
//! use event_outbox::{
//!     AggregateSnapshot, CacheInvalidator, Dispatcher, DispatcherConfig, EventScope,
//!     InMemoryOutboxStore, OutboxEnvelope, OutboxStore, SnapshotSerializer,
//! };
//! use serde::Serialize;
//! use std::sync::Arc;
//!
//! #[derive(Serialize)]
//! struct Asset {
//!     id: String,
//! }
//!
//! impl AggregateSnapshot for Asset {
//!     fn entity_type(&self) -> &'static str {
//!         "Asset"
//!     }
//!     fn entity_id(&self) -> String {
//!         self.id.clone()
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
//! let registry = Arc::new(CacheKeyRegistry::new());
//! let cache = Arc::new(InMemoryCache::new());
//! let serializer = SnapshotSerializer::default();
//!
//! // Producer side: append alongside the aggregate mutation
//! let asset = Asset { id: "123".into() };
//! let envelope = OutboxEnvelope::created(&asset, &EventScope::new("tenant-1"), &serializer)?;
//! store.append(&envelope).await?;
//!
//! // Dispatcher side: deliver and invalidate
//! let invalidator = Arc::new(CacheInvalidator::new(registry, cache));
//! let dispatcher = Dispatcher::new(store, vec![invalidator], DispatcherConfig::default());
//! dispatcher.sweep_once().await?;
//! # Ok(())
//! # }
//! ```

mod alert;
mod consumer;
mod dispatcher;
mod envelope;
mod error;
mod event_id;
mod retry;
mod serializer;
mod store;

pub use alert::{AlertHook, RaisedAlert, RecordingAlert, TracingAlert};
pub use consumer::{
    AuditRecord, AuditSink, AuditTrail, BusMessage, CacheInvalidator, EventConsumer,
    InMemoryAuditSink, InMemoryIntegrationBus, IntegrationBus, IntegrationRelay,
    NatsIntegrationBus, TracingAuditSink,
};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherMetrics, DispatcherSnapshot};
pub use envelope::{
    validate_envelope_fields, AggregateSnapshot, EventAction, EventScope, OutboxEnvelope,
};
pub use error::{OutboxError, OutboxResult};
pub use event_id::{next_event_id, EventId, EventIdGenerator};
pub use retry::{retry_transient, RetryPolicy};
pub use serializer::{SerializerSettings, SnapshotSerializer};
pub use store::{InMemoryOutboxStore, OutboxStore, PgOutboxStore};
