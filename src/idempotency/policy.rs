use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_HEADER_NAME: &str = "Idempotency-Token";
pub const DEFAULT_PARAM_NAME: &str = "token";
pub const DEFAULT_MESSAGE: &str = "Duplicate request, please do not resubmit";

/// Replay behaviour for a protected operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Mode {
    /// Defer to the process-wide `strong_by_default` flag.
    #[default]
    #[serde(rename = "DEFAULT", alias = "default")]
    Default,
    /// Replay the cached result of the first success.
    #[serde(rename = "TRUE", alias = "strong")]
    Strong,
    /// Reject duplicates of a completed operation.
    #[serde(rename = "FALSE", alias = "weak")]
    Weak,
}

impl Mode {
    pub fn is_strong(self, strong_by_default: bool) -> bool {
        match self {
            Mode::Default => strong_by_default,
            Mode::Strong => true,
            Mode::Weak => false,
        }
    }
}

/// Where the token resolver looks for the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenSource {
    Header,
    Param,
    /// Header first, then the request parameter.
    #[default]
    Any,
}

/// Per-operation idempotency settings. Unset values fall back to the
/// coordinator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationPolicy {
    pub token_source: TokenSource,
    pub header_name: String,
    pub param_name: String,
    pub expire_time: Option<Duration>,
    pub mode: Mode,
    pub message: String,
    pub max_retries: Option<u32>,
}

impl Default for OperationPolicy {
    fn default() -> Self {
        Self {
            token_source: TokenSource::default(),
            header_name: DEFAULT_HEADER_NAME.to_string(),
            param_name: DEFAULT_PARAM_NAME.to_string(),
            expire_time: None,
            mode: Mode::default(),
            message: DEFAULT_MESSAGE.to_string(),
            max_retries: None,
        }
    }
}

impl OperationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strong() -> Self {
        Self::new().with_mode(Mode::Strong)
    }

    pub fn weak() -> Self {
        Self::new().with_mode(Mode::Weak)
    }

    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_token_source(mut self, source: TokenSource) -> Self {
        self.token_source = source;
        self
    }

    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.header_name = name.into();
        self
    }

    pub fn with_param_name(mut self, name: impl Into<String>) -> Self {
        self.param_name = name.into();
        self
    }

    pub fn with_expire_time(mut self, expire_time: Duration) -> Self {
        self.expire_time = Some(expire_time);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_resolution() {
        assert!(Mode::Default.is_strong(true));
        assert!(!Mode::Default.is_strong(false));
        assert!(Mode::Strong.is_strong(false));
        assert!(!Mode::Weak.is_strong(true));
    }

    #[test]
    fn test_mode_wire_names() {
        assert_eq!(serde_json::to_string(&Mode::Strong).unwrap(), "\"TRUE\"");
        assert_eq!(serde_json::from_str::<Mode>("\"FALSE\"").unwrap(), Mode::Weak);
        assert_eq!(serde_json::from_str::<Mode>("\"weak\"").unwrap(), Mode::Weak);
        assert_eq!(serde_json::from_str::<Mode>("\"DEFAULT\"").unwrap(), Mode::Default);
    }

    #[test]
    fn test_policy_builder() {
        let policy = OperationPolicy::strong()
            .with_expire_time(Duration::from_secs(10))
            .with_message("already paid")
            .with_max_retries(5)
            .with_header_name("X-Token");

        assert_eq!(policy.mode, Mode::Strong);
        assert_eq!(policy.expire_time, Some(Duration::from_secs(10)));
        assert_eq!(policy.message, "already paid");
        assert_eq!(policy.max_retries, Some(5));
        assert_eq!(policy.header_name, "X-Token");
        assert_eq!(policy.param_name, DEFAULT_PARAM_NAME);
    }
}
