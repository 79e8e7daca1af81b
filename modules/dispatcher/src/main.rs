mod config;
mod health;

use axum::{routing::get, Router};
use cache_registry::{CacheKeyRegistry, InMemoryCache, ProjectionCache};
use config::Config;
use event_outbox::{
    AuditTrail, CacheInvalidator, Dispatcher, DispatcherConfig, EventConsumer,
    InMemoryIntegrationBus, InMemoryOutboxStore, IntegrationBus, IntegrationRelay,
    NatsIntegrationBus, OutboxStore, PgOutboxStore, SnapshotSerializer, TracingAuditSink,
};
use health::health;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting outbox dispatcher...");

    // Load configuration from environment
    let config = Config::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        "Configuration loaded: host={}, port={}, store_type={}, bus_type={}",
        config.host,
        config.port,
        config.store_type,
        config.bus_type
    );

    // Outbox store
    let store: Arc<dyn OutboxStore> = match config.store_type.to_lowercase().as_str() {
        "postgres" => {
            let database_url = config
                .database_url
                .as_deref()
                .expect("DATABASE_URL checked by Config::from_env");

            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await
                .expect("Failed to connect to database");

            tracing::info!("Running migrations...");
            sqlx::migrate!("./db/migrations")
                .run(&pool)
                .await
                .expect("Failed to run migrations");

            Arc::new(PgOutboxStore::new(pool))
        }
        "inmemory" => {
            tracing::info!("Using InMemory outbox store");
            Arc::new(InMemoryOutboxStore::new())
        }
        other => panic!("Invalid STORE_TYPE: {other}. Must be 'postgres' or 'inmemory'"),
    };

    // Integration bus
    let bus: Arc<dyn IntegrationBus> = match config.bus_type.to_lowercase().as_str() {
        "inmemory" => {
            tracing::info!("Using InMemory integration bus");
            Arc::new(InMemoryIntegrationBus::new())
        }
        "nats" => {
            tracing::info!("Connecting to NATS at {}", config.nats_url);
            let client = async_nats::connect(&config.nats_url)
                .await
                .expect("Failed to connect to NATS");
            Arc::new(NatsIntegrationBus::new(client))
        }
        other => panic!("Invalid BUS_TYPE: {other}. Must be 'inmemory' or 'nats'"),
    };

    // Cache registry and projection cache shared with in-process read paths
    let registry = Arc::new(CacheKeyRegistry::new());
    let cache: Arc<dyn ProjectionCache> = Arc::new(InMemoryCache::new());
    let serializer = SnapshotSerializer::default();

    // Consumers, in delivery order: invalidation first, then audit, then relay
    let consumers: Vec<Arc<dyn EventConsumer>> = vec![
        Arc::new(CacheInvalidator::new(registry.clone(), cache)),
        Arc::new(AuditTrail::new(Arc::new(TracingAuditSink))),
        Arc::new(IntegrationRelay::new(bus, serializer)),
    ];

    // Start the dispatcher sweep loop
    let dispatcher = Dispatcher::new(store.clone(), consumers, DispatcherConfig::from_env());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let runner = dispatcher.clone();
    let dispatcher_handle = tokio::spawn(async move { runner.run(shutdown_rx).await });

    // Health endpoint
    let app = Router::new()
        .route("/api/health", get(health))
        .with_state(store);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Dispatcher service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to listen for ctrl-c");
            tracing::info!("Shutdown signal received");
        })
        .await
        .expect("Server failed to start");

    // Let the in-flight sweep finish before exiting
    let _ = shutdown_tx.send(true);
    let _ = dispatcher_handle.await;

    let snapshot = dispatcher.metrics().snapshot();
    tracing::info!(
        delivered = snapshot.delivered,
        failed = snapshot.failed,
        "Dispatcher exited"
    );
}
