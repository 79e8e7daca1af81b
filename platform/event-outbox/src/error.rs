//! Error taxonomy for outbox operations
//!
//! Variants split along the axis the dispatcher cares about: transient
//! failures are retried, permanent ones are surfaced immediately.

use crate::event_id::EventId;
use std::time::Duration;

/// Errors that can occur while appending, claiming, or delivering outbox events
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// An aggregate could not be turned into a JSON payload
    #[error("failed to serialize aggregate snapshot: {0}")]
    Serialization(String),

    /// An envelope with this event id has already been appended
    #[error("duplicate event id on append: {0}")]
    DuplicateEvent(EventId),

    /// The backing store could not be reached or rejected the operation
    #[error("outbox store unavailable: {0}")]
    StoreUnavailable(String),

    /// A consumer failed in a way that should succeed on redelivery
    #[error("transient delivery failure: {0}")]
    TransientDelivery(String),

    /// A single delivery exceeded the configured deadline
    #[error("delivery timed out after {0:?}")]
    DeliveryTimeout(Duration),
}

impl OutboxError {
    /// Whether retrying the failed operation can succeed
    ///
    /// Serialization failures and duplicate ids are permanent: the same input
    /// produces the same outcome, so retrying only burns attempts.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::TransientDelivery(_) | Self::DeliveryTimeout(_)
        )
    }
}

impl From<serde_json::Error> for OutboxError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<cache_registry::CacheError> for OutboxError {
    fn from(err: cache_registry::CacheError) -> Self {
        Self::TransientDelivery(err.to_string())
    }
}

/// Result type for outbox operations
pub type OutboxResult<T> = Result<T, OutboxError>;
