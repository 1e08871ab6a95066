use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for the idempotency coordinator.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    /// `outcome` is one of proceed, replay, unavailable or a rejection reason.
    pub fn record_acquire(&self, outcome: &str) {
        counter!("idempotency_acquire_total", "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_completion(&self, result: &str) {
        counter!("idempotency_complete_total", "result" => result.to_string()).increment(1);
    }

    pub fn record_guard_fallback(&self) {
        counter!("idempotency_guard_fallback_total").increment(1);
    }

    pub fn record_store_operation(&self, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_store_operations_total", "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_store_duration_ms", "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_ms: f64) {
        counter!("http_requests_total", "method" => method.to_string(), "path" => path.to_string(), "status" => status.to_string()).increment(1);
        histogram!("http_request_duration_ms", "method" => method.to_string(), "path" => path.to_string()).record(duration_ms);
    }

    pub fn record_message(&self, topic: &str, outcome: &str) {
        counter!("idempotency_messages_total", "topic" => topic.to_string(), "outcome" => outcome.to_string()).increment(1);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Installs the Prometheus recorder once and returns its handle.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    METRICS.get_or_init(Metrics::new);

    Ok(METRICS_HANDLE.get_or_init(|| handle).clone())
}

fn describe_metrics() {
    describe_counter!("idempotency_acquire_total", Unit::Count, "Acquire calls by outcome");
    describe_counter!("idempotency_complete_total", Unit::Count, "Completions by result");
    describe_counter!("idempotency_guard_fallback_total", Unit::Count, "FAILED markers written after a panic or cancellation");

    describe_counter!("idempotency_store_operations_total", Unit::Count, "Store round trips");
    describe_histogram!("idempotency_store_duration_ms", Unit::Milliseconds, "Store round trip latency in milliseconds");

    describe_counter!("http_requests_total", Unit::Count, "Total HTTP requests");
    describe_histogram!("http_request_duration_ms", Unit::Milliseconds, "HTTP request latency in milliseconds");

    describe_counter!("idempotency_messages_total", Unit::Count, "Consumed messages by outcome");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latency_timer() {
        let timer = LatencyTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        let elapsed = timer.elapsed_ms();
        assert!(elapsed >= 10.0);
    }

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert!(metrics.initialized);
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        let metrics = get_metrics();
        metrics.record_acquire("proceed");
        metrics.record_store_operation("acquire", 0.4, true);
    }
}
