use crate::error::{AppError, Result};
use anyhow::anyhow;
use serde::{Deserialize, Serialize};

pub const PROCESSING: &str = "PROCESSING";
pub const SUCCESS: &str = "SUCCESS";
pub const FAILED: &str = "FAILED";
pub const EXHAUSTED: &str = "EXHAUSTED";

const PAYLOAD_SEPARATOR: char = ':';
const RETRY_COUNTER_SUFFIX: &str = ":retry:count";

/// Value held under `{prefix}{token}` in the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdempotencyRecord {
    /// An execution is in flight. The stored value names the owning attempt.
    Processing,
    /// A previous execution succeeded. The payload is only retained in strong mode.
    Success(Option<String>),
    /// The previous execution raised a business error.
    Failed,
    /// The retry budget was consumed; rejected until the record expires.
    Exhausted,
}

impl IdempotencyRecord {
    /// Encodes the record as stored: `SUCCESS:<payload>` carries the cached result verbatim.
    pub fn encode(&self) -> String {
        match self {
            IdempotencyRecord::Processing => PROCESSING.to_string(),
            IdempotencyRecord::Success(None) => SUCCESS.to_string(),
            IdempotencyRecord::Success(Some(payload)) => {
                format!("{}{}{}", SUCCESS, PAYLOAD_SEPARATOR, payload)
            }
            IdempotencyRecord::Failed => FAILED.to_string(),
            IdempotencyRecord::Exhausted => EXHAUSTED.to_string(),
        }
    }

    pub fn decode(raw: &str) -> Result<Self> {
        match raw {
            PROCESSING => Ok(IdempotencyRecord::Processing),
            _ if processing_owner(raw).is_some() => Ok(IdempotencyRecord::Processing),
            SUCCESS => Ok(IdempotencyRecord::Success(None)),
            FAILED => Ok(IdempotencyRecord::Failed),
            EXHAUSTED => Ok(IdempotencyRecord::Exhausted),
            _ => raw
                .strip_prefix(SUCCESS)
                .and_then(|rest| rest.strip_prefix(PAYLOAD_SEPARATOR))
                .map(|payload| IdempotencyRecord::Success(Some(payload.to_string())))
                .ok_or_else(|| {
                    AppError::Internal(anyhow!("Unrecognised idempotency record value: {}", raw))
                }),
        }
    }

    pub fn status(&self) -> RecordStatus {
        match self {
            IdempotencyRecord::Processing => RecordStatus::Processing,
            IdempotencyRecord::Success(_) => RecordStatus::Success,
            IdempotencyRecord::Failed => RecordStatus::Failed,
            IdempotencyRecord::Exhausted => RecordStatus::Exhausted,
        }
    }

    pub fn payload(&self) -> Option<&str> {
        match self {
            IdempotencyRecord::Success(Some(payload)) => Some(payload),
            _ => None,
        }
    }
}

/// Stored value of a `PROCESSING` record held by `owner`.
pub fn processing_value(owner: &str) -> String {
    format!("{}{}{}", PROCESSING, PAYLOAD_SEPARATOR, owner)
}

/// Owner of a stored `PROCESSING:<owner>` value.
pub fn processing_owner(raw: &str) -> Option<&str> {
    raw.strip_prefix(PROCESSING)?
        .strip_prefix(PAYLOAD_SEPARATOR)
        .filter(|owner| !owner.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordStatus {
    Processing,
    Success,
    Failed,
    Exhausted,
}

/// Store key layout shared by the coordinator, result cache and retry tracker.
#[derive(Debug, Clone)]
pub struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn record_key(&self, token: &str) -> String {
        format!("{}{}", self.prefix, token)
    }

    pub fn retry_counter_key(&self, token: &str) -> String {
        format!("{}{}{}", self.prefix, token, RETRY_COUNTER_SUFFIX)
    }
}

/// Rejects empty or whitespace-only tokens, returning the trimmed token.
pub fn validate_token(token: &str) -> Result<&str> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return Err(AppError::Validation(
            "Idempotency token is required".to_string(),
        ));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_payload_keeps_separators() {
        let record = IdempotencyRecord::Success(Some(r#"{"id":"X-100","note":"a:b"}"#.to_string()));
        let encoded = record.encode();
        assert_eq!(encoded, r#"SUCCESS:{"id":"X-100","note":"a:b"}"#);
        assert_eq!(IdempotencyRecord::decode(&encoded).unwrap(), record);
    }

    #[test]
    fn test_bare_success_marker_has_no_payload() {
        let record = IdempotencyRecord::decode("SUCCESS").unwrap();
        assert_eq!(record, IdempotencyRecord::Success(None));
        assert_eq!(record.payload(), None);
        assert_eq!(record.status(), RecordStatus::Success);
    }

    #[test]
    fn test_empty_payload_is_distinct_from_marker() {
        let record = IdempotencyRecord::decode("SUCCESS:").unwrap();
        assert_eq!(record.payload(), Some(""));
    }

    #[test]
    fn test_unknown_value_is_rejected() {
        assert!(IdempotencyRecord::decode("DONE").is_err());
        assert!(IdempotencyRecord::decode("SUCCESSFUL").is_err());
    }

    #[test]
    fn test_processing_value_carries_owner() {
        let raw = processing_value("a1b2");
        assert_eq!(raw, "PROCESSING:a1b2");
        assert_eq!(processing_owner(&raw), Some("a1b2"));
        assert_eq!(IdempotencyRecord::decode(&raw).unwrap(), IdempotencyRecord::Processing);
        assert_eq!(processing_owner("PROCESSING"), None);
        assert!(IdempotencyRecord::decode("PROCESSING:").is_err());
    }

    #[test]
    fn test_key_layout() {
        let keys = KeyLayout::new("idempotent:");
        assert_eq!(keys.record_key("abc"), "idempotent:abc");
        assert_eq!(keys.retry_counter_key("abc"), "idempotent:abc:retry:count");
    }

    #[test]
    fn test_validate_token() {
        assert_eq!(validate_token("  tok-1 ").unwrap(), "tok-1");
        assert!(matches!(validate_token("   "), Err(AppError::Validation(_))));
        assert!(validate_token("").is_err());
    }
}
