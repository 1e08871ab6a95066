use serde::{Deserialize, Serialize};

/// Request to pay an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayOrderRequest {
    pub amount_cents: i64,
    pub currency: String,
}

impl PayOrderRequest {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        if self.amount_cents <= 0 {
            errors.push(ValidationError { field: "amount_cents".to_string(), message: "amount_cents must be positive".to_string() });
        }
        if self.currency.len() != 3 {
            errors.push(ValidationError { field: "currency".to_string(), message: "currency must be a 3-letter ISO 4217 code".to_string() });
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Request to send a one-time verification code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendCodeRequest {
    pub phone: String,
}

impl SendCodeRequest {
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let digits = self.phone.chars().filter(|c| c.is_ascii_digit()).count();
        if digits < 7 {
            return Err(vec![ValidationError { field: "phone".to_string(), message: "phone must contain at least 7 digits".to_string() }]);
        }
        Ok(())
    }
}

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}
