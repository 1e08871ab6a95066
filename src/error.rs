use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

/// Errors raised by the coordinator and its adapters.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Idempotency store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    DuplicateInFlight(String),

    #[error("{0}")]
    DuplicateCompleted(String),

    #[error("{message}")]
    RetryBudgetExceeded { message: String, attempts: u32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rskafka::client::error::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// True when the shared store could not serve the request.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, AppError::Redis(_) | AppError::StoreUnavailable(_))
    }

    /// True for the duplicate / budget rejections produced by `acquire`.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            AppError::DuplicateInFlight(_)
                | AppError::DuplicateCompleted(_)
                | AppError::RetryBudgetExceeded { .. }
        )
    }

    /// Stable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Redis(_) | AppError::StoreUnavailable(_) => "COORDINATOR_UNAVAILABLE",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::DuplicateInFlight(_) => "DUPLICATE_IN_FLIGHT",
            AppError::DuplicateCompleted(_) => "DUPLICATE_COMPLETED",
            AppError::RetryBudgetExceeded { .. } => "RETRY_BUDGET_EXCEEDED",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Kafka(_) => "KAFKA_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Collapses transport-level store failures into `StoreUnavailable`.
    pub fn into_unavailable(self) -> AppError {
        match self {
            AppError::Redis(e) => AppError::StoreUnavailable(e.to_string()),
            other => other,
        }
    }
}

/// Error returned by `IdempotencyCoordinator::execute`.
///
/// Keeps the wrapped operation's own error intact so callers see business
/// failures exactly as the operation produced them.
#[derive(Debug, Error)]
pub enum ExecuteError<E> {
    #[error(transparent)]
    Idempotency(#[from] AppError),

    #[error("operation failed: {0}")]
    Operation(E),
}

impl<E> ExecuteError<E> {
    pub fn is_rejection(&self) -> bool {
        matches!(self, ExecuteError::Idempotency(e) if e.is_rejection())
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, ExecuteError::Idempotency(e) if e.is_unavailable())
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            ExecuteError::Operation(e) => Some(e),
            ExecuteError::Idempotency(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_errors_collapse_to_unavailable() {
        let err = AppError::Redis(redis::RedisError::from((
            redis::ErrorKind::IoError,
            "connection refused",
        )));
        assert!(err.is_unavailable());

        let collapsed = err.into_unavailable();
        assert!(matches!(collapsed, AppError::StoreUnavailable(_)));
        assert_eq!(collapsed.code(), "COORDINATOR_UNAVAILABLE");
    }

    #[test]
    fn test_rejections_are_not_unavailable() {
        let err = AppError::DuplicateInFlight("slow down".to_string());
        assert!(err.is_rejection());
        assert!(!err.is_unavailable());
        assert_eq!(err.to_string(), "slow down");
    }

    #[test]
    fn test_execute_error_keeps_operation_error() {
        let err: ExecuteError<&str> = ExecuteError::Operation("card declined");
        assert!(!err.is_rejection());
        assert_eq!(err.into_operation(), Some("card declined"));
    }
}
