//! Durable storage for outbox envelopes
//!
//! The store is an append-only log: envelopes are inserted alongside the
//! aggregate mutation they describe, claimed by a dispatcher under a
//! time-bounded lease, and flipped to processed exactly once. Nothing is
//! ever deleted.
//!
//! Two implementations, mirroring the bus split:
//! - [`InMemoryOutboxStore`]: unit tests, local development
//! - [`PgOutboxStore`]: production, append inside the caller's transaction

mod memory;
mod postgres;

pub use memory::InMemoryOutboxStore;
pub use postgres::PgOutboxStore;

use crate::envelope::OutboxEnvelope;
use crate::error::OutboxResult;
use crate::event_id::EventId;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Append-only outbox log with leased claims
///
/// # Claim protocol
///
/// `claim_batch` takes an exclusive, expiring lease on the oldest pending
/// envelopes so several dispatcher instances can run side by side without
/// double-delivering inside a lease window. A claimed envelope returns to
/// the pending pool either explicitly (`release_claim`, on delivery failure)
/// or implicitly when its lease expires (dispatcher crash). Redelivery after
/// lease expiry is the at-least-once contract at work, not a defect.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Append a new envelope
    ///
    /// # Returns
    /// * `Err(OutboxError::DuplicateEvent)` if the event id already exists;
    ///   ids are unique by construction, so a duplicate means a generator
    ///   defect and must not be silently retried
    /// * `Err(OutboxError::StoreUnavailable)` if the store cannot be reached;
    ///   the producer must fail its whole mutation
    async fn append(&self, envelope: &OutboxEnvelope) -> OutboxResult<()>;

    /// Pending envelopes in `event_id` ascending order
    ///
    /// Never returns a processed envelope. Ignores claims: this is the
    /// observational view (monitoring, restart recovery checks), not the
    /// dispatch path.
    async fn fetch_unprocessed(
        &self,
        limit: usize,
        tenant: Option<&str>,
    ) -> OutboxResult<Vec<OutboxEnvelope>>;

    /// Claim up to `limit` pending envelopes under a lease
    ///
    /// Only envelopes whose lease is free or expired are eligible; eligible
    /// envelopes are claimed in `event_id` ascending order and stamped with
    /// `claimant` until the lease runs out.
    async fn claim_batch(
        &self,
        claimant: &str,
        limit: usize,
        lease: Duration,
    ) -> OutboxResult<Vec<OutboxEnvelope>>;

    /// Flip an envelope to processed and stamp `processed_at`
    ///
    /// Idempotent: marking an already-processed envelope is a no-op.
    async fn mark_processed(&self, event_id: EventId) -> OutboxResult<()>;

    /// Return a claimed envelope to the pending pool
    ///
    /// Increments and returns the envelope's attempt count so the dispatcher
    /// can compare it against the alert budget. A no-op returning the current
    /// count for already-processed envelopes.
    async fn release_claim(&self, event_id: EventId) -> OutboxResult<u32>;

    /// Number of envelopes not yet processed
    async fn pending_count(&self) -> OutboxResult<u64>;
}

impl fmt::Debug for dyn OutboxStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutboxStore")
    }
}
