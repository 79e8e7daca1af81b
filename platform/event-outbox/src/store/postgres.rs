//! Postgres-backed implementation of the OutboxStore trait
//!
//! Producers use [`PgOutboxStore::append_in_tx`] to write the envelope inside
//! the same transaction as the aggregate mutation, which is what makes the
//! outbox transactional: either both rows commit or neither does.
//!
//! The claim path takes its lease with a single `UPDATE ... RETURNING` over a
//! `FOR UPDATE SKIP LOCKED` subquery, so concurrent dispatcher instances
//! never block each other and never claim the same row.

use crate::envelope::OutboxEnvelope;
use crate::error::{OutboxError, OutboxResult};
use crate::event_id::EventId;
use crate::store::OutboxStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::time::Duration;
use uuid::Uuid;

/// OutboxStore over the `events_outbox` table
///
/// The table is append-only: rows are inserted by producers and receive
/// exactly one status flip from the dispatcher. See the migration in
/// `modules/dispatcher/db/migrations` for the layout.
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

#[derive(Debug, FromRow)]
struct OutboxRow {
    event_id: Uuid,
    tenant_id: String,
    user_id: Option<String>,
    entity_type: String,
    entity_id: String,
    event_type: String,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    is_processed: bool,
}

impl From<OutboxRow> for OutboxEnvelope {
    fn from(row: OutboxRow) -> Self {
        Self {
            event_id: EventId::from_uuid(row.event_id),
            tenant_id: row.tenant_id,
            user_id: row.user_id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
            processed_at: row.processed_at,
            is_processed: row.is_processed,
        }
    }
}

const INSERT_ENVELOPE: &str = r#"
    INSERT INTO events_outbox
        (event_id, tenant_id, user_id, entity_type, entity_id, event_type,
         payload, occurred_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
"#;

const ENVELOPE_COLUMNS: &str = "event_id, tenant_id, user_id, entity_type, entity_id, \
     event_type, payload, occurred_at, processed_at, is_processed";

impl PgOutboxStore {
    /// Wrap a connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an envelope inside an open transaction
    ///
    /// This is the unit-of-work boundary: the caller's transaction carries
    /// both the aggregate write and this insert, so the envelope persists iff
    /// the mutation does.
    pub async fn append_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        envelope: &OutboxEnvelope,
    ) -> OutboxResult<()> {
        sqlx::query(INSERT_ENVELOPE)
            .bind(envelope.event_id.as_uuid())
            .bind(&envelope.tenant_id)
            .bind(&envelope.user_id)
            .bind(&envelope.entity_type)
            .bind(&envelope.entity_id)
            .bind(&envelope.event_type)
            .bind(&envelope.payload)
            .bind(envelope.occurred_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_insert_error(e, envelope.event_id))?;

        tracing::debug!(
            event_id = %envelope.event_id,
            event_type = %envelope.event_type,
            "Envelope appended to outbox"
        );

        Ok(())
    }
}

fn map_insert_error(e: sqlx::Error, event_id: EventId) -> OutboxError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.is_unique_violation() {
            return OutboxError::DuplicateEvent(event_id);
        }
    }
    OutboxError::StoreUnavailable(e.to_string())
}

fn map_store_error(e: sqlx::Error) -> OutboxError {
    OutboxError::StoreUnavailable(e.to_string())
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn append(&self, envelope: &OutboxEnvelope) -> OutboxResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_store_error)?;
        Self::append_in_tx(&mut tx, envelope).await?;
        tx.commit().await.map_err(map_store_error)
    }

    async fn fetch_unprocessed(
        &self,
        limit: usize,
        tenant: Option<&str>,
    ) -> OutboxResult<Vec<OutboxEnvelope>> {
        let sql = format!(
            r#"
            SELECT {ENVELOPE_COLUMNS}
            FROM events_outbox
            WHERE is_processed = FALSE
              AND ($2::text IS NULL OR tenant_id = $2)
            ORDER BY event_id ASC
            LIMIT $1
            "#
        );
        let rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(limit as i64)
            .bind(tenant)
            .fetch_all(&self.pool)
            .await
            .map_err(map_store_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn claim_batch(
        &self,
        claimant: &str,
        limit: usize,
        lease: Duration,
    ) -> OutboxResult<Vec<OutboxEnvelope>> {
        let claimed_until = Utc::now()
            + chrono::Duration::from_std(lease)
                .map_err(|e| OutboxError::StoreUnavailable(format!("invalid lease: {e}")))?;

        let sql = format!(
            r#"
            UPDATE events_outbox
            SET claimed_by = $1, claimed_until = $2
            WHERE event_id IN (
                SELECT event_id
                FROM events_outbox
                WHERE is_processed = FALSE
                  AND (claimed_until IS NULL OR claimed_until < NOW())
                ORDER BY event_id ASC
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {ENVELOPE_COLUMNS}
            "#
        );
        let mut rows = sqlx::query_as::<_, OutboxRow>(&sql)
            .bind(claimant)
            .bind(claimed_until)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_store_error)?;

        // RETURNING does not guarantee order; restore the fetch order
        rows.sort_by_key(|r| r.event_id);
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn mark_processed(&self, event_id: EventId) -> OutboxResult<()> {
        // The status guard makes this idempotent: a second call matches no row
        sqlx::query(
            r#"
            UPDATE events_outbox
            SET is_processed = TRUE,
                processed_at = NOW(),
                claimed_by = NULL,
                claimed_until = NULL
            WHERE event_id = $1 AND is_processed = FALSE
            "#,
        )
        .bind(event_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(map_store_error)?;

        Ok(())
    }

    async fn release_claim(&self, event_id: EventId) -> OutboxResult<u32> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE events_outbox
            SET claimed_by = NULL,
                claimed_until = NULL,
                attempts = attempts + 1
            WHERE event_id = $1 AND is_processed = FALSE
            RETURNING attempts
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_store_error)?;

        Ok(attempts.unwrap_or(0).max(0) as u32)
    }

    async fn pending_count(&self) -> OutboxResult<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events_outbox WHERE is_processed = FALSE",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_store_error)?;

        Ok(count.max(0) as u64)
    }
}
