//! Time-ordered event identifiers
//!
//! Outbox ordering rides entirely on the event id: ids are UUIDv7, so their
//! byte order is their creation order. Stores can then serve "oldest pending
//! first" with a plain `ORDER BY event_id` and BTree iteration, with no
//! separate sequence column.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, OnceLock};
use uuid::{ContextV7, Timestamp, Uuid};

/// Unique, time-ordered identifier for an outbox event
///
/// Wraps a UUIDv7: 48 bits of Unix milliseconds, then a monotonic counter,
/// then random bits. Comparing two ids compares their creation instants;
/// ids minted through the same generator are strictly increasing even within
/// one millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Wrap an existing UUID (e.g. one read back from the store)
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Generator of strictly increasing [`EventId`]s
///
/// The shared counter context guarantees that two ids minted in the same
/// millisecond through the same generator still order correctly. The context
/// keeps its counter in interior-mutable cells, so it sits behind a mutex
/// here; the lock is held only for the counter bump, and callers stay free
/// of any synchronization of their own.
pub struct EventIdGenerator {
    context: Mutex<ContextV7>,
}

impl EventIdGenerator {
    /// Create a generator with a fresh counter context
    pub fn new() -> Self {
        Self {
            context: Mutex::new(ContextV7::new()),
        }
    }

    /// Mint the next id
    pub fn next_id(&self) -> EventId {
        // A poisoned lock still holds a usable context: the counter state is
        // a plain integer, never left half-written
        let context = self.context.lock().unwrap_or_else(|e| e.into_inner());
        EventId(Uuid::new_v7(Timestamp::now(&*context)))
    }
}

impl Default for EventIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventIdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventIdGenerator")
    }
}

static PROCESS_GENERATOR: OnceLock<EventIdGenerator> = OnceLock::new();

/// Mint an id from the process-wide generator
///
/// Envelope constructors route through this so every producer in the process
/// draws from one counter context, keeping ids monotonic across all of them.
pub fn next_event_id() -> EventId {
    PROCESS_GENERATOR.get_or_init(EventIdGenerator::new).next_id()
}
