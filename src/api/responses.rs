use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::idempotency::{MetricsSnapshot, RecordStatus, TokenState};

/// Standard API response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorResponse>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(error: ErrorResponse) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(error),
        }
    }
}

/// Error response structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub details: Option<Vec<ValidationErrorDetail>>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Vec<ValidationErrorDetail>) -> Self {
        self.details = Some(details);
        self
    }
}

/// Validation error detail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationErrorDetail {
    pub field: String,
    pub message: String,
}

/// Receipt for a paid order. Duplicates of a paid order get this same
/// receipt back, including its id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub receipt_id: Uuid,
    pub order_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub paid_at: DateTime<Utc>,
}

/// Confirmation that a verification code was dispatched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeDispatch {
    pub dispatch_id: Uuid,
    pub phone: String,
    pub sent_at: DateTime<Utc>,
}

/// Coordinator counters for `/stats`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub counters: MetricsSnapshot,
    pub duplicate_rate: f64,
}

impl From<MetricsSnapshot> for StatsResponse {
    fn from(counters: MetricsSnapshot) -> Self {
        let duplicate_rate = counters.duplicate_rate();
        Self {
            counters,
            duplicate_rate,
        }
    }
}

/// Token state DTO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenStateResponse {
    pub token: String,
    pub status: Option<RecordStatus>,
    pub has_payload: bool,
    pub retry_attempts: u32,
}

impl TokenStateResponse {
    pub fn new(token: impl Into<String>, state: TokenState) -> Self {
        Self {
            token: token.into(),
            status: state.status,
            has_payload: state.has_payload,
            retry_attempts: state.retry_attempts,
        }
    }
}
