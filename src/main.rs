use async_trait::async_trait;
use idempotency_coordinator::api::{create_router, AppState};
use idempotency_coordinator::config::Settings;
use idempotency_coordinator::error::Result as AppResult;
use idempotency_coordinator::events::{
    ConsumedMessage, ConsumerConfig, EventConsumer, IdempotentMessageHandler, MessageHandler,
};
use idempotency_coordinator::idempotency::{
    CoordinatorConfig, IdempotencyCoordinator, MemoryStateStore, OperationPolicy,
    RedisStateStore, StateStore,
};
use idempotency_coordinator::observability::{init_logging, init_metrics, HealthChecker, LogConfig};
use std::sync::Arc;
use tracing::{info, warn};

/// Logs every command that makes it past the coordinator.
struct CommandLogger;

#[async_trait]
impl MessageHandler for CommandLogger {
    async fn handle(&self, message: &ConsumedMessage) -> AppResult<()> {
        info!(
            topic = %message.topic,
            offset = message.offset,
            key = ?message.key_str(),
            bytes = message.value.len(),
            "Command processed"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let settings = Settings::new()?;

    init_logging(&LogConfig::new(&settings.logging.level, &settings.logging.format))?;
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    // Connect the shared store
    let store: Arc<dyn StateStore> = if settings.redis.uses_memory_store() {
        warn!("Using the in-process store; duplicates are only detected within this instance");
        Arc::new(MemoryStateStore::new())
    } else {
        info!("Connecting to Redis at {}...", settings.redis.url);
        let client = redis::Client::open(settings.redis.url.as_str())?;
        let store = RedisStateStore::connect(&client).await?;
        store.ping().await?;
        info!("Redis connection established");
        Arc::new(store)
    };

    let coordinator = Arc::new(IdempotencyCoordinator::new(
        Arc::clone(&store),
        CoordinatorConfig::from(&settings.idempotency),
    ));

    // Start the command consumer
    let consumer = match &settings.kafka {
        Some(kafka) => {
            let mut consumer = EventConsumer::new(ConsumerConfig {
                brokers: kafka.brokers.split(',').map(|b| b.trim().to_string()).collect(),
                topics: kafka.topics.clone(),
                ..ConsumerConfig::default()
            });
            consumer.connect().await?;

            let handler = Arc::new(IdempotentMessageHandler::new(
                CommandLogger,
                Arc::clone(&coordinator),
                OperationPolicy::weak().with_header_name(kafka.token_header.as_str()),
            ));
            let consumer = Arc::new(consumer);
            let runner = Arc::clone(&consumer);
            tokio::spawn(async move {
                if let Err(e) = runner.run(handler).await {
                    warn!("Consumer exited: {}", e);
                }
            });
            Some(consumer)
        }
        None => None,
    };

    let mut health_checker = HealthChecker::new(Arc::clone(&store));
    if let Some(consumer) = &consumer {
        health_checker = health_checker.with_consumer(Arc::clone(consumer));
    }

    let state = AppState::new(Arc::clone(&coordinator))
        .with_metrics(metrics_handle)
        .with_health_checker(Arc::new(health_checker));
    let app = create_router(state);

    let addr = format!("{}:{}", settings.application.host, settings.application.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    if let Some(consumer) = consumer {
        consumer.stop();
    }
    info!("Shutdown complete");
    Ok(())
}
