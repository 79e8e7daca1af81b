//! # Outbox Envelope
//!
//! The single envelope shape every aggregate change is captured in before it
//! reaches the outbox store.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: one envelope struct for every entity kind;
//!    `event_type` carries the discriminant (`AssetCreated`, `MerchantUpdated`)
//! 2. **Full Snapshots**: the payload is the complete post-change state, so
//!    consumers never have to reassemble deltas
//! 3. **Self-describing**: tenant, actor, entity kind, and entity id travel
//!    with the event; consumers need no side lookups
//!
//! ## Envelope Fields
//!
//! - `event_id`: time-ordered unique identifier (UUIDv7)
//! - `tenant_id`: multi-tenant isolation
//! - `user_id`: actor that triggered the change, when known
//! - `entity_type` / `entity_id`: the aggregate this event describes
//! - `event_type`: `{entity_type}{action}` discriminant
//! - `payload`: serialized aggregate snapshot
//! - `occurred_at` / `processed_at` / `is_processed`: lifecycle timestamps

use crate::error::OutboxResult;
use crate::event_id::{next_event_id, EventId};
use crate::serializer::SnapshotSerializer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// Contract an aggregate satisfies to be captured in outbox events
///
/// # Example
///
/// ```rust
/// use event_outbox::AggregateSnapshot;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Asset {
///     id: String,
///     merchant_id: String,
///     name: String,
/// }
///
/// impl AggregateSnapshot for Asset {
///     fn entity_type(&self) -> &'static str {
///         "Asset"
///     }
///
///     fn entity_id(&self) -> String {
///         self.id.clone()
///     }
/// }
/// ```
pub trait AggregateSnapshot: Serialize {
    /// Entity-kind name used in `event_type` and cache-key resolution
    fn entity_type(&self) -> &'static str;

    /// Primary identifier of this aggregate instance
    fn entity_id(&self) -> String;
}

/// What happened to the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventAction {
    Created,
    Updated,
}

impl EventAction {
    /// PascalCase fragment used in `event_type`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Updated => "Updated",
        }
    }
}

impl fmt::Display for EventAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant and actor attribution for an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventScope {
    /// Tenant the change belongs to
    pub tenant_id: String,
    /// Acting user, when the change was user-initiated
    pub user_id: Option<String>,
}

impl EventScope {
    /// Scope a change to a tenant with no known actor (system jobs, imports)
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
        }
    }

    /// Attach the acting user
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// An aggregate change captured for asynchronous delivery
///
/// Envelopes are created in the same unit of work as the aggregate mutation,
/// appended to the outbox store, and later claimed by the dispatcher. The
/// `is_processed` flag only ever moves from `false` to `true`.
///
/// # Examples
///
/// ```rust
/// use event_outbox::{AggregateSnapshot, EventScope, OutboxEnvelope, SnapshotSerializer};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Asset {
///     id: String,
///     name: String,
/// }
///
/// impl AggregateSnapshot for Asset {
///     fn entity_type(&self) -> &'static str {
///         "Asset"
///     }
///     fn entity_id(&self) -> String {
///         self.id.clone()
///     }
/// }
///
/// let serializer = SnapshotSerializer::default();
/// let asset = Asset { id: "123".into(), name: "press".into() };
/// let scope = EventScope::new("tenant-1").with_user("u-9");
///
/// let envelope = OutboxEnvelope::created(&asset, &scope, &serializer).unwrap();
/// assert_eq!(envelope.event_type, "AssetCreated");
/// assert_eq!(envelope.entity_id, "123");
/// assert!(!envelope.is_processed);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEnvelope {
    /// Time-ordered unique identifier (idempotency key)
    pub event_id: EventId,

    /// Tenant identifier for multi-tenant isolation
    pub tenant_id: String,

    /// Acting user, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Entity-kind name (e.g. "Asset")
    pub entity_type: String,

    /// Identifier of the changed aggregate instance
    pub entity_id: String,

    /// Discriminant in `{entity_type}{action}` form (e.g. "AssetCreated")
    pub event_type: String,

    /// Full post-change snapshot of the aggregate
    pub payload: Value,

    /// When the change happened
    pub occurred_at: DateTime<Utc>,

    /// When the dispatcher finished delivering this event
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,

    /// Whether delivery has completed
    pub is_processed: bool,
}

impl OutboxEnvelope {
    /// Capture a newly created aggregate
    ///
    /// # Arguments
    /// * `aggregate` - The post-creation state
    /// * `scope` - Tenant and actor attribution
    /// * `serializer` - Serializer whose settings shape the payload
    pub fn created<A: AggregateSnapshot>(
        aggregate: &A,
        scope: &EventScope,
        serializer: &SnapshotSerializer,
    ) -> OutboxResult<Self> {
        Self::for_action(aggregate, EventAction::Created, scope, serializer)
    }

    /// Capture an updated aggregate
    pub fn updated<A: AggregateSnapshot>(
        aggregate: &A,
        scope: &EventScope,
        serializer: &SnapshotSerializer,
    ) -> OutboxResult<Self> {
        Self::for_action(aggregate, EventAction::Updated, scope, serializer)
    }

    /// Capture an aggregate change with an explicit action
    pub fn for_action<A: AggregateSnapshot>(
        aggregate: &A,
        action: EventAction,
        scope: &EventScope,
        serializer: &SnapshotSerializer,
    ) -> OutboxResult<Self> {
        Ok(Self {
            event_id: next_event_id(),
            tenant_id: scope.tenant_id.clone(),
            user_id: scope.user_id.clone(),
            entity_type: aggregate.entity_type().to_string(),
            entity_id: aggregate.entity_id(),
            event_type: format!("{}{}", aggregate.entity_type(), action),
            payload: serializer.to_payload(aggregate)?,
            occurred_at: Utc::now(),
            processed_at: None,
            is_processed: false,
        })
    }

    /// Replace the event id (useful for deterministic tests)
    pub fn with_event_id(mut self, event_id: EventId) -> Self {
        self.event_id = event_id;
        self
    }

    /// Replace the occurrence timestamp (useful for deterministic tests)
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }

    /// Every identifier this event touches
    ///
    /// Contains the entity's own id plus any identifier-shaped members found
    /// in the payload (`id`, `_id`, `*_id`, `*Id`), at any nesting level.
    /// Cross-entity projection keys (e.g. `MerchantAssets-m77` when an asset
    /// changes) resolve through these.
    pub fn affected_identifiers(&self) -> BTreeSet<String> {
        let mut identifiers = BTreeSet::new();
        identifiers.insert(self.entity_id.clone());
        collect_identifiers(&self.payload, &mut identifiers);
        identifiers
    }
}

fn is_identifier_member(key: &str) -> bool {
    key == "id" || key == "_id" || key.ends_with("_id") || key.ends_with("Id")
}

fn collect_identifiers(value: &Value, out: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, member) in map {
                if is_identifier_member(key) {
                    match member {
                        Value::String(s) if !s.is_empty() => {
                            out.insert(s.clone());
                        }
                        Value::Number(n) => {
                            out.insert(n.to_string());
                        }
                        _ => {}
                    }
                }
                collect_identifiers(member, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_identifiers(item, out);
            }
        }
        _ => {}
    }
}

/// Validate a serialized envelope at a bus boundary
///
/// [`crate::IntegrationRelay`] runs this over the outgoing document before
/// publishing, and receivers can run it over anything they pull off the bus.
///
/// # Validation Rules
///
/// - `event_id`, `occurred_at`: must be present strings
/// - `tenant_id`, `entity_type`, `entity_id`, `event_type`: must be non-empty
///
/// # Errors
///
/// Returns a descriptive error string if validation fails
pub fn validate_envelope_fields(envelope: &Value) -> Result<(), String> {
    envelope
        .get("event_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid event_id")?;

    envelope
        .get("occurred_at")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid occurred_at")?;

    for field in ["tenant_id", "entity_type", "entity_id", "event_type"] {
        let value = envelope
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("Missing or invalid {field}"))?;
        if value.is_empty() {
            return Err(format!("{field} cannot be empty"));
        }
    }

    Ok(())
}
