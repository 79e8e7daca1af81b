//! In-memory implementation of the OutboxStore trait for testing and development

use crate::envelope::OutboxEnvelope;
use crate::error::{OutboxError, OutboxResult};
use crate::event_id::EventId;
use crate::store::OutboxStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Store-side bookkeeping attached to each envelope
#[derive(Debug, Clone)]
struct OutboxRecord {
    envelope: OutboxEnvelope,
    attempts: u32,
    claimed_by: Option<String>,
    claimed_until: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    fn claim_is_held(&self, now: DateTime<Utc>) -> bool {
        self.claimed_until.is_some_and(|until| until > now)
    }
}

/// OutboxStore implementation backed by an in-process ordered map
///
/// This implementation is suitable for:
/// - Unit and integration tests (no external dependencies)
/// - Local development without Docker
///
/// The map is keyed by [`EventId`], so BTree iteration order is creation
/// order and every fetch is naturally `event_id` ascending.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    records: Mutex<BTreeMap<EventId, OutboxRecord>>,
}

impl InMemoryOutboxStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch one envelope by id, regardless of state (test inspection)
    pub async fn get(&self, event_id: EventId) -> Option<OutboxEnvelope> {
        self.records
            .lock()
            .await
            .get(&event_id)
            .map(|r| r.envelope.clone())
    }

    /// Current attempt count for an envelope (test inspection)
    pub async fn attempts(&self, event_id: EventId) -> Option<u32> {
        self.records.lock().await.get(&event_id).map(|r| r.attempts)
    }

    /// Total number of envelopes ever appended
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    /// Whether the log is empty
    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, envelope: &OutboxEnvelope) -> OutboxResult<()> {
        let mut records = self.records.lock().await;
        if records.contains_key(&envelope.event_id) {
            return Err(OutboxError::DuplicateEvent(envelope.event_id));
        }
        records.insert(
            envelope.event_id,
            OutboxRecord {
                envelope: envelope.clone(),
                attempts: 0,
                claimed_by: None,
                claimed_until: None,
            },
        );
        Ok(())
    }

    async fn fetch_unprocessed(
        &self,
        limit: usize,
        tenant: Option<&str>,
    ) -> OutboxResult<Vec<OutboxEnvelope>> {
        let records = self.records.lock().await;
        Ok(records
            .values()
            .filter(|r| !r.envelope.is_processed)
            .filter(|r| tenant.is_none_or(|t| r.envelope.tenant_id == t))
            .take(limit)
            .map(|r| r.envelope.clone())
            .collect())
    }

    async fn claim_batch(
        &self,
        claimant: &str,
        limit: usize,
        lease: Duration,
    ) -> OutboxResult<Vec<OutboxEnvelope>> {
        let now = Utc::now();
        let until = now
            + chrono::Duration::from_std(lease)
                .map_err(|e| OutboxError::StoreUnavailable(format!("invalid lease: {e}")))?;

        let mut records = self.records.lock().await;
        let mut claimed = Vec::new();
        for record in records.values_mut() {
            if claimed.len() >= limit {
                break;
            }
            if record.envelope.is_processed || record.claim_is_held(now) {
                continue;
            }
            record.claimed_by = Some(claimant.to_string());
            record.claimed_until = Some(until);
            claimed.push(record.envelope.clone());
        }
        Ok(claimed)
    }

    async fn mark_processed(&self, event_id: EventId) -> OutboxResult<()> {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&event_id) {
            if !record.envelope.is_processed {
                record.envelope.is_processed = true;
                record.envelope.processed_at = Some(Utc::now());
                record.claimed_by = None;
                record.claimed_until = None;
            }
        }
        Ok(())
    }

    async fn release_claim(&self, event_id: EventId) -> OutboxResult<u32> {
        let mut records = self.records.lock().await;
        match records.get_mut(&event_id) {
            Some(record) if !record.envelope.is_processed => {
                record.claimed_by = None;
                record.claimed_until = None;
                record.attempts += 1;
                Ok(record.attempts)
            }
            Some(record) => Ok(record.attempts),
            None => Ok(0),
        }
    }

    async fn pending_count(&self) -> OutboxResult<u64> {
        let records = self.records.lock().await;
        Ok(records.values().filter(|r| !r.envelope.is_processed).count() as u64)
    }
}
