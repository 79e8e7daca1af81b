//! Snapshot serialization with explicit, immutable settings
//!
//! Producers hold one [`SnapshotSerializer`] built at startup and pass it to
//! envelope constructors. Settings travel with the value instead of living in
//! a process-global, so two components can serialize differently without
//! fighting over shared mutable state.

use crate::error::{OutboxError, OutboxResult};
use serde::Serialize;
use serde_json::Value;

/// Normalization applied when turning an aggregate into a JSON payload
#[derive(Debug, Clone)]
pub struct SerializerSettings {
    /// Drop object members whose value is null
    pub omit_nulls: bool,
    /// Maximum container nesting a payload may reach
    pub max_depth: usize,
}

impl Default for SerializerSettings {
    fn default() -> Self {
        Self {
            omit_nulls: true,
            max_depth: 32,
        }
    }
}

/// Serializes aggregate snapshots into outbox payloads
#[derive(Debug, Clone, Default)]
pub struct SnapshotSerializer {
    settings: SerializerSettings,
}

impl SnapshotSerializer {
    /// Create a serializer with explicit settings
    pub fn new(settings: SerializerSettings) -> Self {
        Self { settings }
    }

    /// The settings this serializer was built with
    pub fn settings(&self) -> &SerializerSettings {
        &self.settings
    }

    /// Serialize a value into a payload document
    ///
    /// Null object members are dropped when `omit_nulls` is set; null array
    /// elements are kept because their position carries meaning. Payloads
    /// nesting deeper than `max_depth` are rejected rather than written, so
    /// runaway recursive structures fail at the producer instead of poisoning
    /// the outbox.
    ///
    /// # Returns
    /// * `Ok(Value)` - the normalized payload
    /// * `Err(OutboxError::Serialization)` - the value could not be encoded
    ///   or nests too deeply
    pub fn to_payload<T: Serialize + ?Sized>(&self, value: &T) -> OutboxResult<Value> {
        let mut payload = serde_json::to_value(value)?;
        let depth = container_depth(&payload);
        if depth > self.settings.max_depth {
            return Err(OutboxError::Serialization(format!(
                "payload nesting depth {depth} exceeds limit {}",
                self.settings.max_depth
            )));
        }
        if self.settings.omit_nulls {
            strip_null_members(&mut payload);
        }
        Ok(payload)
    }

    /// Serialize a value straight to bytes (for bus publication)
    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> OutboxResult<Vec<u8>> {
        let payload = self.to_payload(value)?;
        Ok(serde_json::to_vec(&payload)?)
    }
}

/// Nesting depth counting only containers; scalars are depth 0
fn container_depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(container_depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(container_depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn strip_null_members(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            for v in map.values_mut() {
                strip_null_members(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_null_members(v);
            }
        }
        _ => {}
    }
}
