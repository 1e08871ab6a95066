use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use std::collections::HashMap;
use uuid::Uuid;

use crate::api::requests::{PayOrderRequest, SendCodeRequest, ValidationError};
use crate::api::responses::{
    ApiResponse, CodeDispatch, ErrorResponse, PaymentReceipt, StatsResponse, TokenStateResponse,
    ValidationErrorDetail,
};
use crate::error::{AppError, ExecuteError};
use crate::idempotency::{OperationPolicy, TokenResolver};
use crate::observability::{get_metrics, ServiceHealth, LatencyTimer};

use super::routes::AppState;

/// Orders above this amount are declined by the payment step.
pub const PAYMENT_LIMIT_CENTS: i64 = 1_000_000;

pub type ApiError = (StatusCode, Json<ApiResponse<()>>);

fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (status, Json(ApiResponse::<()>::error(ErrorResponse::new(code, message))))
}

fn validation_error(errors: Vec<ValidationError>) -> ApiError {
    let details: Vec<ValidationErrorDetail> = errors
        .into_iter()
        .map(|e| ValidationErrorDetail {
            field: e.field,
            message: e.message,
        })
        .collect();

    (
        StatusCode::BAD_REQUEST,
        Json(ApiResponse::<()>::error(
            ErrorResponse::new("VALIDATION_ERROR", "Request validation failed").with_details(details),
        )),
    )
}

/// Maps coordinator errors onto HTTP statuses.
pub fn coordinator_error(error: &AppError) -> ApiError {
    if error.is_rejection() {
        return api_error(StatusCode::CONFLICT, error.code(), error.to_string());
    }
    if error.is_unavailable() {
        return api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            error.code(),
            "Idempotency coordinator unavailable, please retry later",
        );
    }
    match error {
        AppError::Validation(msg) => api_error(StatusCode::BAD_REQUEST, error.code(), msg.clone()),
        _ => {
            tracing::error!("Idempotent request failed: {}", error);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred",
            )
        }
    }
}

fn require_token(
    policy: &OperationPolicy,
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<String, ApiError> {
    TokenResolver::from_policy(policy)
        .resolve(headers, params)
        .ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "MISSING_TOKEN",
                format!(
                    "Idempotency token required in header '{}' or parameter '{}'",
                    policy.header_name, policy.param_name
                ),
            )
        })
}

fn observe(method: &str, path: &str, status: StatusCode, timer: LatencyTimer) {
    get_metrics().record_http_request(method, path, status.as_u16(), timer.elapsed_ms());
}

/// Health check endpoint.
pub async fn health_check(State(state): State<AppState>) -> Json<ApiResponse<ServiceHealth>> {
    Json(ApiResponse::success(state.health_checker.check_all().await))
}

/// Readiness check endpoint.
pub async fn readiness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check endpoint.
pub async fn liveness_check(State(state): State<AppState>) -> StatusCode {
    if state.health_checker.is_alive() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            "metrics recorder not installed".to_string(),
        ),
    }
}

/// Coordinator counters.
pub async fn stats(State(state): State<AppState>) -> Json<ApiResponse<StatsResponse>> {
    let snapshot = state.coordinator.metrics().snapshot();
    Json(ApiResponse::success(StatsResponse::from(snapshot)))
}

/// Current record status and retry count of a token.
pub async fn get_token_state(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<ApiResponse<TokenStateResponse>>, ApiError> {
    match state.coordinator.inspect(&token).await {
        Ok(token_state) => Ok(Json(ApiResponse::success(TokenStateResponse::new(
            token,
            token_state,
        )))),
        Err(e) => Err(coordinator_error(&e.into_unavailable())),
    }
}

// ============================================================================
// Protected Operations
// ============================================================================

/// Pays an order. Strong mode: a duplicate gets the original receipt.
pub async fn pay_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(request): Json<PayOrderRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PaymentReceipt>>), ApiError> {
    let timer = LatencyTimer::new();
    let result = pay_order_inner(&state, order_id, &params, &headers, request).await;

    let status = match &result {
        Ok((status, _)) => *status,
        Err((status, _)) => *status,
    };
    observe("POST", "/orders/:id/pay", status, timer);
    result
}

async fn pay_order_inner(
    state: &AppState,
    order_id: String,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    request: PayOrderRequest,
) -> Result<(StatusCode, Json<ApiResponse<PaymentReceipt>>), ApiError> {
    let token = require_token(&state.pay_policy, headers, params)?;
    request.validate().map_err(validation_error)?;

    let result = state
        .coordinator
        .execute(&token, &state.pay_policy, || async {
            if request.amount_cents > PAYMENT_LIMIT_CENTS {
                return Err(format!(
                    "Payment of {} {} exceeds the limit of {}",
                    request.amount_cents, request.currency, PAYMENT_LIMIT_CENTS
                ));
            }

            tracing::info!(order_id = %order_id, amount_cents = request.amount_cents, "Order paid");
            Ok(PaymentReceipt {
                receipt_id: Uuid::new_v4(),
                order_id: order_id.clone(),
                amount_cents: request.amount_cents,
                currency: request.currency.to_uppercase(),
                paid_at: chrono::Utc::now(),
            })
        })
        .await;

    match result {
        Ok(receipt) => Ok((StatusCode::OK, Json(ApiResponse::success(receipt)))),
        Err(ExecuteError::Operation(reason)) => Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            "PAYMENT_DECLINED",
            reason,
        )),
        Err(ExecuteError::Idempotency(e)) => Err(coordinator_error(&e)),
    }
}

/// Sends a verification code. Weak mode: a duplicate is rejected outright.
pub async fn send_code(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(request): Json<SendCodeRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CodeDispatch>>), ApiError> {
    let timer = LatencyTimer::new();
    let result = send_code_inner(&state, &params, &headers, request).await;

    let status = match &result {
        Ok((status, _)) => *status,
        Err((status, _)) => *status,
    };
    observe("POST", "/codes/send", status, timer);
    result
}

async fn send_code_inner(
    state: &AppState,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
    request: SendCodeRequest,
) -> Result<(StatusCode, Json<ApiResponse<CodeDispatch>>), ApiError> {
    let token = require_token(&state.code_policy, headers, params)?;
    request.validate().map_err(validation_error)?;

    let result = state
        .coordinator
        .execute(&token, &state.code_policy, || async {
            tracing::info!("Verification code dispatched");
            Ok::<_, AppError>(CodeDispatch {
                dispatch_id: Uuid::new_v4(),
                phone: request.phone.clone(),
                sent_at: chrono::Utc::now(),
            })
        })
        .await;

    match result {
        Ok(dispatch) => Ok((StatusCode::ACCEPTED, Json(ApiResponse::success(dispatch)))),
        Err(ExecuteError::Operation(e)) | Err(ExecuteError::Idempotency(e)) => {
            Err(coordinator_error(&e))
        }
    }
}
