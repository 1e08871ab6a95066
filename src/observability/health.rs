use crate::events::EventConsumer;
use crate::idempotency::StateStore;
use crate::observability::{get_metrics, LatencyTimer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Severity, ordered so the worst component decides the overall status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// One checked component: the shared store or the command consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentHealth {
    fn with_status(name: impl Into<String>, status: HealthStatus, detail: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            latency_ms: None,
            detail,
        }
    }

    pub fn up(name: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    pub fn degraded(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(detail.into()))
    }

    pub fn down(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(detail.into()))
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Body of the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    /// False while the store is down: every acquire would fail closed.
    pub accepting_requests: bool,
    pub version: String,
    pub uptime_seconds: u64,
    pub components: Vec<ComponentHealth>,
}

impl ServiceHealth {
    pub fn new(version: String, uptime_seconds: u64, components: Vec<ComponentHealth>) -> Self {
        let status = components
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            accepting_requests: !status.is_unhealthy(),
            version,
            uptime_seconds,
            components,
        }
    }
}

/// How long a store ping may take before it counts as slow or failed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PingThresholds {
    pub timeout: Duration,
    pub slow_after: Duration,
}

impl Default for PingThresholds {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            slow_after: Duration::from_millis(50),
        }
    }
}

/// Checks the shared store and, when one runs, the command consumer.
pub struct HealthChecker {
    store: Arc<dyn StateStore>,
    consumer: Option<Arc<EventConsumer>>,
    thresholds: PingThresholds,
    started: Instant,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            consumer: None,
            thresholds: PingThresholds::default(),
            started: Instant::now(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: PingThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<EventConsumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    pub async fn check_all(&self) -> ServiceHealth {
        let mut components = vec![self.check_store().await];
        if let Some(consumer) = &self.consumer {
            components.push(Self::check_consumer(consumer));
        }

        ServiceHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.uptime_seconds(),
            components,
        )
    }

    pub async fn check_store(&self) -> ComponentHealth {
        let name = self.store.name();
        let timer = LatencyTimer::new();

        let result = tokio::time::timeout(self.thresholds.timeout, self.store.ping()).await;
        let latency = timer.elapsed_ms();
        get_metrics().record_store_operation("ping", latency, matches!(result, Ok(Ok(()))));

        match result {
            Ok(Ok(())) if latency > self.thresholds.slow_after.as_secs_f64() * 1000.0 => {
                ComponentHealth::degraded(name, "Store answers slowly").with_latency(latency)
            }
            Ok(Ok(())) => ComponentHealth::up(name).with_latency(latency),
            Ok(Err(e)) => ComponentHealth::down(name, format!("Ping failed: {}", e)),
            Err(_) => ComponentHealth::down(
                name,
                format!("No answer within {:?}", self.thresholds.timeout),
            ),
        }
    }

    /// A stopped consumer only delays message handling, so it never fails the service.
    pub fn check_consumer(consumer: &EventConsumer) -> ComponentHealth {
        if !consumer.is_connected() {
            ComponentHealth::degraded("consumer", "Not connected to brokers")
        } else if !consumer.is_running() {
            ComponentHealth::degraded("consumer", "Stopped")
        } else {
            ComponentHealth::up("consumer")
        }
    }

    pub fn is_alive(&self) -> bool {
        true
    }

    /// Ready while the store answers; requests would otherwise all fail closed.
    pub async fn is_ready(&self) -> bool {
        !self.check_store().await.status.is_unhealthy()
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
