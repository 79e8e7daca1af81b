//! End-to-end dispatcher flows over the in-memory store, cache, and bus

use async_trait::async_trait;
use cache_registry::{CacheError, CacheKeyRegistry, CacheResult, InMemoryCache, ProjectionCache};
use event_outbox::{
    AggregateSnapshot, CacheInvalidator, Dispatcher, DispatcherConfig, EventScope,
    InMemoryAuditSink, InMemoryIntegrationBus, InMemoryOutboxStore, IntegrationRelay,
    OutboxEnvelope, OutboxError, OutboxStore, RecordingAlert, RetryPolicy, SnapshotSerializer,
};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Serialize)]
struct Asset {
    id: String,
    merchant_id: String,
    name: String,
}

impl AggregateSnapshot for Asset {
    fn entity_type(&self) -> &'static str {
        "Asset"
    }

    fn entity_id(&self) -> String {
        self.id.clone()
    }
}

fn asset(id: &str, merchant: &str) -> Asset {
    Asset {
        id: id.into(),
        merchant_id: merchant.into(),
        name: "press".into(),
    }
}

fn quick_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_interval: Duration::from_millis(10),
        batch_size: 100,
        max_parallel_deliveries: 8,
        delivery_timeout: Duration::from_millis(500),
        claim_lease: Duration::from_millis(500),
        max_attempts: 5,
        claimant: "test-dispatcher".into(),
    }
}

fn instant_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(1),
    }
}

/// Cache that fails the first `failures` evictions, then delegates
struct FlakyCache {
    inner: InMemoryCache,
    failures: AtomicU32,
}

impl FlakyCache {
    fn failing(failures: u32) -> Self {
        Self {
            inner: InMemoryCache::new(),
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl ProjectionCache for FlakyCache {
    async fn evict(&self, key: &str) -> CacheResult<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CacheError::Unavailable("cache down".into()));
        }
        self.inner.evict(key).await
    }

    async fn contains(&self, key: &str) -> CacheResult<bool> {
        self.inner.contains(key).await
    }
}

/// Cache that records the order keys are evicted in
#[derive(Default)]
struct RecordingCache {
    evictions: Mutex<Vec<String>>,
}

impl RecordingCache {
    fn evictions(&self) -> Vec<String> {
        self.evictions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProjectionCache for RecordingCache {
    async fn evict(&self, key: &str) -> CacheResult<()> {
        self.evictions.lock().unwrap().push(key.to_string());
        Ok(())
    }

    async fn contains(&self, _key: &str) -> CacheResult<bool> {
        Ok(false)
    }
}

#[tokio::test]
async fn test_sweep_evicts_registered_key_and_marks_processed() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let registry = Arc::new(CacheKeyRegistry::new());
    let cache = Arc::new(InMemoryCache::new());
    let serializer = SnapshotSerializer::default();

    // A read path cached asset 123 and registered its key
    registry.register("AssetByIdJustOne-123");
    cache.insert("AssetByIdJustOne-123", json!({"id": "123"}));

    let envelope = OutboxEnvelope::updated(
        &asset("123", "m77"),
        &EventScope::new("tenant-1"),
        &serializer,
    )
    .unwrap();
    store.append(&envelope).await.unwrap();

    let invalidator = Arc::new(CacheInvalidator::new(registry.clone(), cache.clone()));
    let dispatcher = Dispatcher::new(store.clone(), vec![invalidator], quick_config());

    let delivered = dispatcher.sweep_once().await.unwrap();

    assert_eq!(delivered, 1);
    assert!(!registry.contains("AssetByIdJustOne-123"));
    assert!(cache.get("AssetByIdJustOne-123").is_none());
    let stored = store.get(envelope.event_id).await.unwrap();
    assert!(stored.is_processed);
    assert!(stored.processed_at.is_some());
}

#[tokio::test]
async fn test_unaffected_keys_survive_sweeps() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let registry = Arc::new(CacheKeyRegistry::new());
    let cache = Arc::new(InMemoryCache::new());
    let serializer = SnapshotSerializer::default();

    registry.register("MerchantByIdJustOne-other");
    registry.register("OfficersAllJustTen");

    let envelope = OutboxEnvelope::updated(
        &asset("123", "m77"),
        &EventScope::new("tenant-1"),
        &serializer,
    )
    .unwrap();
    store.append(&envelope).await.unwrap();

    let invalidator = Arc::new(CacheInvalidator::new(registry.clone(), cache));
    let dispatcher = Dispatcher::new(store, vec![invalidator], quick_config());
    dispatcher.sweep_once().await.unwrap();

    assert!(registry.contains("MerchantByIdJustOne-other"));
    assert!(registry.contains("OfficersAllJustTen"));
}

#[tokio::test]
async fn test_same_entity_envelopes_deliver_in_event_id_order() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let registry = Arc::new(CacheKeyRegistry::new());
    let cache = Arc::new(RecordingCache::default());
    let serializer = SnapshotSerializer::default();
    let scope = EventScope::new("tenant-1");

    let e1 = OutboxEnvelope::created(&asset("123", "m1"), &scope, &serializer).unwrap();
    let e2 = OutboxEnvelope::updated(&asset("123", "m2"), &scope, &serializer).unwrap();
    assert!(e1.event_id < e2.event_id);
    store.append(&e1).await.unwrap();
    store.append(&e2).await.unwrap();

    // Distinct keys per envelope's merchant let us observe eviction order
    registry.register("MerchantAssets-m1");
    registry.register("MerchantAssets-m2");

    let invalidator = Arc::new(CacheInvalidator::new(registry, cache.clone()));
    let dispatcher = Dispatcher::new(store.clone(), vec![invalidator], quick_config());
    let delivered = dispatcher.sweep_once().await.unwrap();

    assert_eq!(delivered, 2);
    // E1's eviction happened before E2's began
    assert_eq!(
        cache.evictions(),
        vec!["MerchantAssets-m1".to_string(), "MerchantAssets-m2".to_string()]
    );
    assert!(store.get(e1.event_id).await.unwrap().is_processed);
    assert!(store.get(e2.event_id).await.unwrap().is_processed);
}

#[tokio::test]
async fn test_transient_eviction_failure_recovers_on_later_sweeps() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let registry = Arc::new(CacheKeyRegistry::new());
    // Fails twice, then works
    let cache = Arc::new(FlakyCache::failing(2));
    let serializer = SnapshotSerializer::default();

    registry.register("AssetByIdJustOne-123");

    let envelope = OutboxEnvelope::updated(
        &asset("123", "m77"),
        &EventScope::new("tenant-1"),
        &serializer,
    )
    .unwrap();
    store.append(&envelope).await.unwrap();

    let invalidator = Arc::new(CacheInvalidator::new(registry.clone(), cache));
    let dispatcher =
        Dispatcher::new(store.clone(), vec![invalidator], quick_config()).with_retry_policy(instant_retry());

    // Two failing sweeps leave the envelope pending
    for _ in 0..2 {
        let delivered = dispatcher.sweep_once().await.unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(store.pending_count().await.unwrap(), 1);
    }

    // Third sweep succeeds: processed, key gone
    let delivered = dispatcher.sweep_once().await.unwrap();
    assert_eq!(delivered, 1);
    assert!(!registry.contains("AssetByIdJustOne-123"));
    assert!(store.get(envelope.event_id).await.unwrap().is_processed);
    assert_eq!(store.attempts(envelope.event_id).await.unwrap(), 2);
}

#[tokio::test]
async fn test_failure_skips_rest_of_entity_group_for_the_sweep() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let registry = Arc::new(CacheKeyRegistry::new());
    // One failure: E1's eviction fails, E2 must not run ahead of it
    let cache = Arc::new(FlakyCache::failing(1));
    let serializer = SnapshotSerializer::default();
    let scope = EventScope::new("tenant-1");

    registry.register("AssetByIdJustOne-123");

    let e1 = OutboxEnvelope::created(&asset("123", "m77"), &scope, &serializer).unwrap();
    let e2 = OutboxEnvelope::updated(&asset("123", "m77"), &scope, &serializer).unwrap();
    store.append(&e1).await.unwrap();
    store.append(&e2).await.unwrap();

    let invalidator = Arc::new(CacheInvalidator::new(registry, cache));
    let mut config = quick_config();
    // Short lease so the second sweep can reclaim what the first left claimed
    config.claim_lease = Duration::from_millis(30);
    let dispatcher =
        Dispatcher::new(store.clone(), vec![invalidator], config).with_retry_policy(instant_retry());

    assert_eq!(dispatcher.sweep_once().await.unwrap(), 0);
    assert!(!store.get(e1.event_id).await.unwrap().is_processed);
    assert!(!store.get(e2.event_id).await.unwrap().is_processed);

    // E2 stayed claimed when its group aborted; wait out the lease
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dispatcher.sweep_once().await.unwrap(), 2);
    assert!(store.get(e1.event_id).await.unwrap().is_processed);
    assert!(store.get(e2.event_id).await.unwrap().is_processed);
}

#[tokio::test]
async fn test_crash_before_mark_processed_redelivers_safely() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let registry = Arc::new(CacheKeyRegistry::new());
    let cache = Arc::new(InMemoryCache::new());
    let serializer = SnapshotSerializer::default();

    registry.register("AssetByIdJustOne-123");

    let envelope = OutboxEnvelope::updated(
        &asset("123", "m77"),
        &EventScope::new("tenant-1"),
        &serializer,
    )
    .unwrap();
    store.append(&envelope).await.unwrap();

    // First dispatcher claims the batch, evicts, then "crashes" before
    // mark_processed: simulate by claiming and evicting manually
    let claimed = store
        .claim_batch("crashed-dispatcher", 10, Duration::from_millis(30))
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    cache.evict("AssetByIdJustOne-123").await.unwrap();

    // The envelope is still visible as unprocessed after the crash
    let pending = store.fetch_unprocessed(10, None).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_id, envelope.event_id);

    // A restarted dispatcher reclaims it after the lease and re-evicts the
    // now-absent key without error
    tokio::time::sleep(Duration::from_millis(50)).await;
    let invalidator = Arc::new(CacheInvalidator::new(registry.clone(), cache));
    let dispatcher = Dispatcher::new(store.clone(), vec![invalidator], quick_config());
    let delivered = dispatcher.sweep_once().await.unwrap();

    assert_eq!(delivered, 1);
    assert!(store.get(envelope.event_id).await.unwrap().is_processed);
    assert!(!registry.contains("AssetByIdJustOne-123"));
}

#[tokio::test]
async fn test_concurrent_producers_append_distinct_ordered_envelopes() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let serializer = Arc::new(SnapshotSerializer::default());

    let mut handles = Vec::new();
    for producer in 0..8 {
        let store = store.clone();
        let serializer = serializer.clone();
        handles.push(tokio::spawn(async move {
            let scope = EventScope::new(format!("tenant-{producer}"));
            let mut ids = Vec::new();
            for i in 0..25 {
                let envelope = OutboxEnvelope::created(
                    &asset(&format!("{producer}-{i}"), "m77"),
                    &scope,
                    &serializer,
                )
                .unwrap();
                store.append(&envelope).await.unwrap();
                ids.push(envelope.event_id);
            }
            ids
        }));
    }

    for handle in handles {
        let ids = handle.await.unwrap();
        // Ids within one producer strictly increase with creation order
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    // All 200 appended, none lost to collisions
    assert_eq!(store.len().await, 200);
    assert_eq!(store.pending_count().await.unwrap(), 200);

    // Fetch returns them in global event_id order
    let fetched = store.fetch_unprocessed(200, None).await.unwrap();
    for pair in fetched.windows(2) {
        assert!(pair[0].event_id < pair[1].event_id);
    }
}

#[tokio::test]
async fn test_alert_raised_once_at_attempt_budget() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let registry = Arc::new(CacheKeyRegistry::new());
    // Never recovers within this test
    let cache = Arc::new(FlakyCache::failing(u32::MAX));
    let serializer = SnapshotSerializer::default();

    registry.register("AssetByIdJustOne-123");

    let envelope = OutboxEnvelope::updated(
        &asset("123", "m77"),
        &EventScope::new("tenant-1"),
        &serializer,
    )
    .unwrap();
    store.append(&envelope).await.unwrap();

    let alert = Arc::new(RecordingAlert::new());
    let mut config = quick_config();
    config.max_attempts = 2;
    let invalidator = Arc::new(CacheInvalidator::new(registry, cache));
    let dispatcher = Dispatcher::new(store.clone(), vec![invalidator], config)
        .with_retry_policy(instant_retry())
        .with_alert(alert.clone());

    for _ in 0..4 {
        dispatcher.sweep_once().await.unwrap();
    }

    // Fired exactly when attempts crossed the budget, envelope still pending
    let raised = alert.raised();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].event_id, envelope.event_id);
    assert_eq!(raised[0].attempts, 2);
    assert_eq!(store.pending_count().await.unwrap(), 1);
    assert_eq!(dispatcher.metrics().snapshot().alerts_raised, 1);
}

#[tokio::test]
async fn test_full_pipeline_with_audit_and_relay() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let registry = Arc::new(CacheKeyRegistry::new());
    let cache = Arc::new(InMemoryCache::new());
    let sink = Arc::new(InMemoryAuditSink::new());
    let bus = Arc::new(InMemoryIntegrationBus::new());
    let mut receiver = bus.subscribe();
    let serializer = SnapshotSerializer::default();

    registry.register("AssetsAllJustTen");

    let envelope = OutboxEnvelope::created(
        &asset("123", "m77"),
        &EventScope::new("tenant-1").with_user("u-9"),
        &serializer,
    )
    .unwrap();
    store.append(&envelope).await.unwrap();

    let consumers: Vec<Arc<dyn event_outbox::EventConsumer>> = vec![
        Arc::new(CacheInvalidator::new(registry.clone(), cache)),
        Arc::new(event_outbox::AuditTrail::new(sink.clone())),
        Arc::new(IntegrationRelay::new(bus, serializer.clone())),
    ];
    let dispatcher = Dispatcher::new(store.clone(), consumers, quick_config());

    assert_eq!(dispatcher.sweep_once().await.unwrap(), 1);

    // Cache invalidated
    assert!(!registry.contains("AssetsAllJustTen"));
    // Audit record written
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tenant_id, "tenant-1");
    assert_eq!(records[0].user_id.as_deref(), Some("u-9"));
    // Envelope relayed
    let msg = receiver.recv().await.unwrap();
    assert_eq!(msg.subject, "compliance.events.asset.created");
    // Store flipped
    assert!(store.get(envelope.event_id).await.unwrap().is_processed);
}

#[tokio::test]
async fn test_mark_processed_twice_equals_once() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let serializer = SnapshotSerializer::default();
    let envelope = OutboxEnvelope::created(
        &asset("123", "m77"),
        &EventScope::new("tenant-1"),
        &serializer,
    )
    .unwrap();
    store.append(&envelope).await.unwrap();

    store.mark_processed(envelope.event_id).await.unwrap();
    let first = store.get(envelope.event_id).await.unwrap();
    store.mark_processed(envelope.event_id).await.unwrap();
    let second = store.get(envelope.event_id).await.unwrap();

    assert!(first.is_processed && second.is_processed);
    // The status flip happened once: the timestamp did not move
    assert_eq!(first.processed_at, second.processed_at);
}

#[tokio::test]
async fn test_duplicate_event_id_append_is_fatal() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let serializer = SnapshotSerializer::default();
    let envelope = OutboxEnvelope::created(
        &asset("123", "m77"),
        &EventScope::new("tenant-1"),
        &serializer,
    )
    .unwrap();

    store.append(&envelope).await.unwrap();
    let err = store.append(&envelope).await.unwrap_err();
    assert!(matches!(err, OutboxError::DuplicateEvent(_)));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_run_loop_delivers_and_stops_on_shutdown() {
    let store = Arc::new(InMemoryOutboxStore::new());
    let registry = Arc::new(CacheKeyRegistry::new());
    let cache = Arc::new(InMemoryCache::new());
    let serializer = SnapshotSerializer::default();

    registry.register("AssetByIdJustOne-123");
    let envelope = OutboxEnvelope::updated(
        &asset("123", "m77"),
        &EventScope::new("tenant-1"),
        &serializer,
    )
    .unwrap();
    store.append(&envelope).await.unwrap();

    let invalidator = Arc::new(CacheInvalidator::new(registry, cache));
    let dispatcher = Dispatcher::new(store.clone(), vec![invalidator], quick_config());

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = dispatcher.clone();
    let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

    // Wait for the poll loop to deliver
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while store.pending_count().await.unwrap() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "delivery timed out");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    assert!(store.get(envelope.event_id).await.unwrap().is_processed);
    assert_eq!(dispatcher.metrics().snapshot().delivered, 1);
}
