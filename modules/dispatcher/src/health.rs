use axum::extract::State;
use axum::Json;
use event_outbox::OutboxStore;
use serde_json::Value;
use std::sync::Arc;

/// Health check endpoint handler
///
/// Reports the pending backlog alongside liveness so operators can spot a
/// stalled dispatcher from the health probe alone.
pub async fn health(State(store): State<Arc<dyn OutboxStore>>) -> Json<Value> {
    let pending = store.pending_count().await.ok();
    Json(serde_json::json!({
        "status": "healthy",
        "service": "dispatcher-rs",
        "version": env!("CARGO_PKG_VERSION"),
        "pending_envelopes": pending
    }))
}
