use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::idempotency::{IdempotencyCoordinator, OperationPolicy};
use crate::observability::HealthChecker;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<IdempotencyCoordinator>,
    pub pay_policy: Arc<OperationPolicy>,
    pub code_policy: Arc<OperationPolicy>,
    pub metrics_handle: Option<PrometheusHandle>,
    pub health_checker: Arc<HealthChecker>,
}

impl AppState {
    /// Payments replay the first receipt; code dispatches reject duplicates.
    pub fn new(coordinator: Arc<IdempotencyCoordinator>) -> Self {
        let health_checker = Arc::new(HealthChecker::new(coordinator.store()));
        Self {
            coordinator,
            pay_policy: Arc::new(
                OperationPolicy::strong().with_message("Order is already being paid"),
            ),
            code_policy: Arc::new(
                OperationPolicy::weak().with_message("Code already sent, please wait before retrying"),
            ),
            metrics_handle: None,
            health_checker,
        }
    }

    /// Adds metrics handle to the state.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Adds health checker to the state.
    pub fn with_health_checker(mut self, checker: Arc<HealthChecker>) -> Self {
        self.health_checker = checker;
        self
    }

    pub fn with_pay_policy(mut self, policy: OperationPolicy) -> Self {
        self.pay_policy = Arc::new(policy);
        self
    }

    pub fn with_code_policy(mut self, policy: OperationPolicy) -> Self {
        self.code_policy = Arc::new(policy);
        self
    }
}

/// Creates the main API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health endpoints
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/live", get(handlers::liveness_check))
        // Metrics endpoints
        .route("/metrics", get(handlers::metrics_endpoint))
        .route("/stats", get(handlers::stats))
        .route("/tokens/:token", get(handlers::get_token_state))
        // Protected operations
        .route("/orders/:id/pay", post(handlers::pay_order))
        .route("/codes/send", post(handlers::send_code))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}
