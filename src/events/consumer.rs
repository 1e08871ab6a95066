use crate::error::{AppError, ExecuteError, Result};
use crate::idempotency::{IdempotencyCoordinator, OperationPolicy, TokenResolver};
use crate::observability::{get_metrics, mask_token};
use anyhow::anyhow;
use async_trait::async_trait;
use rskafka::client::partition::{PartitionClient, UnknownTopicHandling};
use rskafka::client::ClientBuilder;
use rskafka::record::RecordAndOffset;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Configuration for the Kafka consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
    pub fetch_max_wait_ms: i32,
    pub max_poll_records: usize,
    pub idle_backoff: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            topics: vec!["idempotent.commands".to_string()],
            fetch_max_wait_ms: 500,
            max_poll_records: 100,
            idle_backoff: Duration::from_millis(10),
        }
    }
}

/// Message received from Kafka.
#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: BTreeMap<String, Vec<u8>>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ConsumedMessage {
    /// Deserializes the message value as JSON.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.value).map_err(AppError::Serialization)
    }

    /// Gets the key as a string.
    pub fn key_str(&self) -> Option<String> {
        self.key.as_ref().and_then(|k| String::from_utf8(k.clone()).ok())
    }
}

/// Handler trait for processing consumed messages.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Processes a single message. An error leaves the message for redelivery.
    async fn handle(&self, message: &ConsumedMessage) -> Result<()>;
}

/// What to do with a message that carries no idempotency token.
///
/// Such a message never gains a token on redelivery, so neither choice
/// leaves it on the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingTokenPolicy {
    /// Acknowledge it without calling the inner handler.
    #[default]
    Skip,
    /// Hand the message to the inner handler without protection.
    Passthrough,
}

/// Runs the inner handler at most once per message token, so a redelivered
/// message is acknowledged without being processed again.
pub struct IdempotentMessageHandler<H> {
    inner: H,
    coordinator: Arc<IdempotencyCoordinator>,
    policy: OperationPolicy,
    resolver: TokenResolver,
    missing_token: MissingTokenPolicy,
}

impl<H: MessageHandler> IdempotentMessageHandler<H> {
    pub fn new(inner: H, coordinator: Arc<IdempotencyCoordinator>, policy: OperationPolicy) -> Self {
        let resolver = TokenResolver::from_policy(&policy);
        Self {
            inner,
            coordinator,
            policy,
            resolver,
            missing_token: MissingTokenPolicy::default(),
        }
    }

    pub fn with_missing_token_policy(mut self, missing_token: MissingTokenPolicy) -> Self {
        self.missing_token = missing_token;
        self
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for IdempotentMessageHandler<H> {
    async fn handle(&self, message: &ConsumedMessage) -> Result<()> {
        let Some(token) = self.resolver.resolve_message(&message.headers) else {
            return match self.missing_token {
                MissingTokenPolicy::Skip => {
                    get_metrics().record_message(&message.topic, "missing_token");
                    warn!(
                        topic = %message.topic,
                        offset = message.offset,
                        header = %self.policy.header_name,
                        "Skipping message without idempotency token"
                    );
                    Ok(())
                }
                MissingTokenPolicy::Passthrough => self.inner.handle(message).await,
            };
        };

        let result = self
            .coordinator
            .execute(&token, &self.policy, || self.inner.handle(message))
            .await;

        match result {
            Ok(()) => {
                get_metrics().record_message(&message.topic, "processed");
                Ok(())
            }
            Err(ExecuteError::Idempotency(e)) if e.is_rejection() => {
                get_metrics().record_message(&message.topic, "duplicate");
                info!(
                    topic = %message.topic,
                    offset = message.offset,
                    token = %mask_token(&token),
                    "Skipping redelivered message: {}",
                    e
                );
                Ok(())
            }
            Err(ExecuteError::Idempotency(e)) => Err(e),
            Err(ExecuteError::Operation(e)) => {
                get_metrics().record_message(&message.topic, "failed");
                Err(e)
            }
        }
    }
}

/// Kafka event consumer reading partition 0 of each configured topic.
pub struct EventConsumer {
    config: ConsumerConfig,
    client: Option<Arc<rskafka::client::Client>>,
    partition_clients: Arc<RwLock<BTreeMap<String, Arc<PartitionClient>>>>,
    offsets: Arc<RwLock<BTreeMap<String, AtomicI64>>>,
    running: Arc<AtomicBool>,
}

impl EventConsumer {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            client: None,
            partition_clients: Arc::new(RwLock::new(BTreeMap::new())),
            offsets: Arc::new(RwLock::new(BTreeMap::new())),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        info!("Connecting consumer to Kafka brokers: {:?}", self.config.brokers);

        let client = ClientBuilder::new(self.config.brokers.clone())
            .build()
            .await
            .map_err(AppError::Kafka)?;
        self.client = Some(Arc::new(client));

        for topic in &self.config.topics {
            self.get_partition_client(topic).await?;
        }

        info!("Consumer successfully connected to Kafka");
        Ok(())
    }

    async fn get_partition_client(&self, topic: &str) -> Result<Arc<PartitionClient>> {
        {
            let clients = self.partition_clients.read().await;
            if let Some(client) = clients.get(topic) {
                return Ok(client.clone());
            }
        }

        let kafka_client = self
            .client
            .as_ref()
            .ok_or_else(|| AppError::Internal(anyhow!("Kafka client not connected")))?;

        let client = Arc::new(
            kafka_client
                .partition_client(topic.to_string(), 0, UnknownTopicHandling::Retry)
                .await
                .map_err(AppError::Kafka)?,
        );

        self.partition_clients
            .write()
            .await
            .insert(topic.to_string(), client.clone());
        self.offsets
            .write()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| AtomicI64::new(0));

        Ok(client)
    }

    async fn get_offset(&self, topic: &str) -> i64 {
        let offsets = self.offsets.read().await;
        offsets
            .get(topic)
            .map(|o| o.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    async fn update_offset(&self, topic: &str, offset: i64) {
        self.offsets
            .write()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(offset, Ordering::SeqCst);
    }

    /// Offset the next poll of `topic` starts from.
    pub async fn position(&self, topic: &str) -> i64 {
        self.get_offset(topic).await
    }

    /// Polls for messages from a specific topic.
    pub async fn poll(&self, topic: &str) -> Result<Vec<ConsumedMessage>> {
        let partition_client = self.get_partition_client(topic).await?;
        let current_offset = self.get_offset(topic).await;

        let (records, _high_watermark) = partition_client
            .fetch_records(current_offset, 1..1_000_000, self.config.fetch_max_wait_ms)
            .await
            .map_err(AppError::Kafka)?;

        let messages: Vec<ConsumedMessage> = records
            .into_iter()
            .take(self.config.max_poll_records)
            .map(|r: RecordAndOffset| ConsumedMessage {
                topic: topic.to_string(),
                partition: 0,
                offset: r.offset,
                key: r.record.key,
                value: r.record.value.unwrap_or_default(),
                headers: r.record.headers,
                timestamp: r.record.timestamp,
            })
            .collect();

        debug!("Polled {} messages from topic {}", messages.len(), topic);
        Ok(messages)
    }

    /// Consumes until `stop` is called. A failed message is not skipped: the
    /// offset stays on it and it is fetched again on the next poll.
    pub async fn run<H: MessageHandler + ?Sized>(&self, handler: Arc<H>) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        info!("Starting consumer for topics: {:?}", self.config.topics);

        while self.running.load(Ordering::SeqCst) {
            for topic in &self.config.topics {
                let messages = match self.poll(topic).await {
                    Ok(messages) => messages,
                    Err(e) => {
                        warn!("Failed to poll topic {}: {}", topic, e);
                        continue;
                    }
                };

                self.process_batch(topic, &messages, handler.as_ref()).await;
            }

            tokio::time::sleep(self.config.idle_backoff).await;
        }

        info!("Consumer stopped");
        Ok(())
    }

    /// Hands `messages` to `handler` in order, advancing the position past each
    /// one handled. Stops at the first failure so that message is fetched again.
    /// Returns how many messages were acknowledged.
    pub async fn process_batch<H: MessageHandler + ?Sized>(
        &self,
        topic: &str,
        messages: &[ConsumedMessage],
        handler: &H,
    ) -> usize {
        let mut acknowledged = 0;
        for message in messages {
            if let Err(e) = handler.handle(message).await {
                error!(
                    "Failed to process message at {}/{}: {}",
                    message.topic, message.offset, e
                );
                break;
            }
            self.update_offset(topic, message.offset + 1).await;
            acknowledged += 1;
        }
        acknowledged
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Consumer stop requested");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(headers: BTreeMap<String, Vec<u8>>) -> ConsumedMessage {
        ConsumedMessage {
            topic: "test".to_string(),
            partition: 0,
            offset: 0,
            key: Some(b"test-key".to_vec()),
            value: br#"{"id": 1, "name": "test"}"#.to_vec(),
            headers,
            timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_consumer_config_default() {
        let config = ConsumerConfig::default();
        assert_eq!(config.brokers, vec!["localhost:9092".to_string()]);
        assert_eq!(config.max_poll_records, 100);
    }

    #[test]
    fn test_consumer_starts_disconnected() {
        let consumer = EventConsumer::new(ConsumerConfig::default());
        assert!(!consumer.is_connected());
        assert!(!consumer.is_running());
    }

    #[test]
    fn test_consumed_message_accessors() {
        #[derive(serde::Deserialize, PartialEq, Debug)]
        struct TestPayload {
            id: i32,
            name: String,
        }

        let message = message(BTreeMap::new());
        assert_eq!(message.key_str(), Some("test-key".to_string()));

        let payload: TestPayload = message.deserialize().unwrap();
        assert_eq!(payload.id, 1);
        assert_eq!(payload.name, "test");
    }
}
