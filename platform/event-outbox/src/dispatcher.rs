//! Background dispatcher: claims pending envelopes and delivers them
//!
//! One logical dispatcher polls the outbox on a fixed tick. Each sweep claims
//! the oldest pending envelopes under a lease, groups them per (entity type,
//! entity id), and delivers the groups concurrently under a semaphore bound.
//! Within a group delivery is strictly sequential in `event_id` order, so two
//! changes to the same aggregate are always applied downstream in the order
//! they happened; across unrelated aggregates no order is promised.
//!
//! A failed or timed-out delivery releases the claim and skips the rest of
//! its group for that sweep; the next sweep picks the group up again from the
//! failed envelope. Nothing is ever dropped: once the attempt count reaches
//! the configured budget the failure is raised through the [`AlertHook`] and
//! the envelope keeps being retried.

use crate::alert::{AlertHook, TracingAlert};
use crate::consumer::EventConsumer;
use crate::envelope::OutboxEnvelope;
use crate::error::{OutboxError, OutboxResult};
use crate::retry::{retry_transient, RetryPolicy};
use crate::store::OutboxStore;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::time::{interval, timeout, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_MAX_PARALLEL: usize = 8;
const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CLAIM_LEASE_MS: u64 = 30_000;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Configuration for the dispatcher sweep loop
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to sweep for pending envelopes (default: 1 second)
    pub poll_interval: Duration,

    /// Maximum envelopes claimed per sweep (default: 100)
    pub batch_size: usize,

    /// Maximum deliveries in flight at once (default: 8)
    pub max_parallel_deliveries: usize,

    /// Deadline for one envelope's delivery; a timeout returns the envelope
    /// to pending (default: 30 seconds)
    pub delivery_timeout: Duration,

    /// How long a claim excludes other dispatcher instances; must exceed
    /// `delivery_timeout` or a slow delivery can be double-claimed
    /// (default: 30 seconds)
    pub claim_lease: Duration,

    /// Attempt count at which the alert hook fires (default: 5)
    pub max_attempts: u32,

    /// Name this dispatcher instance claims envelopes under
    pub claimant: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            batch_size: DEFAULT_BATCH_SIZE,
            max_parallel_deliveries: DEFAULT_MAX_PARALLEL,
            delivery_timeout: Duration::from_millis(DEFAULT_DELIVERY_TIMEOUT_MS),
            claim_lease: Duration::from_millis(DEFAULT_CLAIM_LEASE_MS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            claimant: default_claimant(),
        }
    }
}

fn default_claimant() -> String {
    format!("dispatcher-{}", uuid::Uuid::new_v4().simple())
}

impl DispatcherConfig {
    /// Create DispatcherConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `OUTBOX_POLL_INTERVAL_MS`: Sweep interval (default: 1000)
    /// - `OUTBOX_BATCH_SIZE`: Max envelopes per sweep (default: 100)
    /// - `OUTBOX_MAX_PARALLEL`: Max concurrent deliveries (default: 8)
    /// - `OUTBOX_DELIVERY_TIMEOUT_MS`: Per-delivery deadline (default: 30000)
    /// - `OUTBOX_CLAIM_LEASE_MS`: Claim lease duration (default: 30000)
    /// - `OUTBOX_MAX_ATTEMPTS`: Alert threshold (default: 5)
    /// - `OUTBOX_CLAIMANT`: Instance name (default: random)
    pub fn from_env() -> Self {
        let poll_interval = Duration::from_millis(env_parsed(
            "OUTBOX_POLL_INTERVAL_MS",
            DEFAULT_POLL_INTERVAL_MS,
        ));
        let batch_size = env_parsed("OUTBOX_BATCH_SIZE", DEFAULT_BATCH_SIZE);
        let max_parallel_deliveries = env_parsed("OUTBOX_MAX_PARALLEL", DEFAULT_MAX_PARALLEL);
        let delivery_timeout = Duration::from_millis(env_parsed(
            "OUTBOX_DELIVERY_TIMEOUT_MS",
            DEFAULT_DELIVERY_TIMEOUT_MS,
        ));
        let claim_lease = Duration::from_millis(env_parsed(
            "OUTBOX_CLAIM_LEASE_MS",
            DEFAULT_CLAIM_LEASE_MS,
        ));
        let max_attempts = env_parsed("OUTBOX_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS);
        let claimant = std::env::var("OUTBOX_CLAIMANT").unwrap_or_else(|_| default_claimant());

        Self {
            poll_interval,
            batch_size,
            max_parallel_deliveries,
            delivery_timeout,
            claim_lease,
            max_attempts,
            claimant,
        }
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters tracking dispatcher activity since startup
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    /// Sweeps completed
    pub sweeps: AtomicU64,

    /// Envelopes delivered and marked processed
    pub delivered: AtomicU64,

    /// Failed delivery attempts (the envelope stays pending)
    pub failed: AtomicU64,

    /// Alerts raised for envelopes at the attempt budget
    pub alerts_raised: AtomicU64,
}

impl DispatcherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the dispatcher counters
#[derive(Debug, Clone)]
pub struct DispatcherSnapshot {
    pub sweeps: u64,
    pub delivered: u64,
    pub failed: u64,
    pub alerts_raised: u64,
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// Claims pending envelopes and fans them out to the registered consumers
///
/// Cloning is cheap: clones share the store, consumers, metrics, and the
/// parallelism bound.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn OutboxStore>,
    consumers: Arc<Vec<Arc<dyn EventConsumer>>>,
    config: Arc<DispatcherConfig>,
    retry: RetryPolicy,
    alert: Arc<dyn AlertHook>,
    metrics: Arc<DispatcherMetrics>,
    semaphore: Arc<Semaphore>,
}

impl Dispatcher {
    /// Build a dispatcher over a store and an ordered list of consumers
    ///
    /// Consumers run in list order for every envelope; put the cache
    /// invalidator first so read models are coherent before the event leaves
    /// the process.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        consumers: Vec<Arc<dyn EventConsumer>>,
        config: DispatcherConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_deliveries.max(1)));
        Self {
            store,
            consumers: Arc::new(consumers),
            config: Arc::new(config),
            retry: RetryPolicy::default(),
            alert: Arc::new(TracingAlert),
            metrics: Arc::new(DispatcherMetrics::new()),
            semaphore,
        }
    }

    /// Replace the alert hook
    pub fn with_alert(mut self, alert: Arc<dyn AlertHook>) -> Self {
        self.alert = alert;
        self
    }

    /// Replace the store-retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The dispatcher's activity counters
    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        self.metrics.clone()
    }

    /// Run the sweep loop until the shutdown signal flips to `true`
    ///
    /// Shutdown is only observed between sweeps; an in-flight sweep finishes
    /// its claimed envelopes first. An interrupted delivery is safe either
    /// way: its claim lease expires and the envelope is redelivered.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut tick = interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            claimant = %self.config.claimant,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_parallel = self.config.max_parallel_deliveries,
            "Outbox dispatcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        tracing::info!("Outbox dispatcher shutting down");
                        break;
                    }
                }

                _ = tick.tick() => {
                    match self.sweep_once().await {
                        Ok(count) if count > 0 => {
                            tracing::info!(delivered = count, "Sweep delivered envelopes");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e, "Sweep failed, will retry next tick");
                        }
                    }
                }
            }
        }

        let snapshot = self.metrics.snapshot();
        tracing::info!(
            sweeps = snapshot.sweeps,
            delivered = snapshot.delivered,
            failed = snapshot.failed,
            alerts_raised = snapshot.alerts_raised,
            "Outbox dispatcher stopped"
        );
    }

    /// Claim and deliver one batch; returns the number of envelopes processed
    ///
    /// Exposed so tests and one-shot jobs can drive the dispatcher without
    /// the polling loop.
    pub async fn sweep_once(&self) -> OutboxResult<usize> {
        self.metrics.sweeps.fetch_add(1, Ordering::Relaxed);

        let claimed = retry_transient(
            || {
                self.store.claim_batch(
                    &self.config.claimant,
                    self.config.batch_size,
                    self.config.claim_lease,
                )
            },
            &self.retry,
            "claim_batch",
        )
        .await?;

        if claimed.is_empty() {
            return Ok(0);
        }

        tracing::debug!(claimed = claimed.len(), "Claimed pending envelopes");

        // Per-entity groups keep same-aggregate events in event_id order;
        // the claim batch is already ascending, so push order is group order
        let mut groups: BTreeMap<(String, String), Vec<OutboxEnvelope>> = BTreeMap::new();
        for envelope in claimed {
            groups
                .entry((envelope.entity_type.clone(), envelope.entity_id.clone()))
                .or_default()
                .push(envelope);
        }

        let mut handles = Vec::with_capacity(groups.len());
        for (_, group) in groups {
            let dispatcher = self.clone();
            handles.push(tokio::spawn(
                async move { dispatcher.deliver_group(group).await },
            ));
        }

        let mut delivered = 0;
        for handle in handles {
            match handle.await {
                Ok(count) => delivered += count,
                Err(e) => {
                    // A panicked group leaves its envelopes claimed; the
                    // lease expiry returns them to pending
                    tracing::error!(error = %e, "Delivery group task panicked");
                }
            }
        }

        Ok(delivered)
    }

    /// Deliver one entity's envelopes sequentially, stopping at the first failure
    async fn deliver_group(&self, envelopes: Vec<OutboxEnvelope>) -> usize {
        let mut delivered = 0;

        for envelope in envelopes {
            let permit = match self.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let outcome = match timeout(self.config.delivery_timeout, self.deliver(&envelope)).await
            {
                Ok(result) => result,
                Err(_) => Err(OutboxError::DeliveryTimeout(self.config.delivery_timeout)),
            };
            drop(permit);

            let outcome = match outcome {
                Ok(()) => self
                    .store
                    .mark_processed(envelope.event_id)
                    .await
                    .map_err(|e| {
                        // Consumers already ran; redelivery after the lease
                        // expires re-runs them, which they must tolerate
                        tracing::warn!(
                            event_id = %envelope.event_id,
                            error = %e,
                            "Delivered but failed to mark processed"
                        );
                        e
                    }),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                    delivered += 1;
                    tracing::debug!(
                        event_id = %envelope.event_id,
                        event_type = %envelope.event_type,
                        "Envelope delivered"
                    );
                }
                Err(e) => {
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    self.handle_failure(&envelope, e).await;
                    // Skip the rest of this entity's envelopes so they are
                    // not delivered ahead of the failed one
                    break;
                }
            }
        }

        delivered
    }

    /// Run every consumer against one envelope, in registration order
    async fn deliver(&self, envelope: &OutboxEnvelope) -> OutboxResult<()> {
        for consumer in self.consumers.iter() {
            consumer.handle(envelope).await.map_err(|e| {
                tracing::warn!(
                    event_id = %envelope.event_id,
                    consumer = consumer.name(),
                    error = %e,
                    "Consumer failed"
                );
                e
            })?;
        }
        Ok(())
    }

    /// Return a failed envelope to pending and alert at the attempt budget
    async fn handle_failure(&self, envelope: &OutboxEnvelope, error: OutboxError) {
        match self.store.release_claim(envelope.event_id).await {
            Ok(attempts) => {
                tracing::warn!(
                    event_id = %envelope.event_id,
                    attempts = attempts,
                    error = %error,
                    "Delivery failed, envelope returned to pending"
                );
                // Exactly at the budget: fires once per crossing, not on
                // every subsequent retry
                if attempts == self.config.max_attempts {
                    self.metrics.alerts_raised.fetch_add(1, Ordering::Relaxed);
                    self.alert.raise(envelope, attempts, &error).await;
                }
            }
            Err(release_err) => {
                // The claim lease will expire on its own; log both failures
                tracing::error!(
                    event_id = %envelope.event_id,
                    delivery_error = %error,
                    release_error = %release_err,
                    "Failed to release claim after delivery failure"
                );
            }
        }
    }
}
