use crate::idempotency::policy::{OperationPolicy, TokenSource};
use http::HeaderMap;
use std::collections::{BTreeMap, HashMap};

/// Extracts the idempotency token from a request or message.
#[derive(Debug, Clone)]
pub struct TokenResolver {
    source: TokenSource,
    header_name: String,
    param_name: String,
}

impl TokenResolver {
    pub fn new(
        source: TokenSource,
        header_name: impl Into<String>,
        param_name: impl Into<String>,
    ) -> Self {
        Self {
            source,
            header_name: header_name.into(),
            param_name: param_name.into(),
        }
    }

    pub fn from_policy(policy: &OperationPolicy) -> Self {
        Self::new(policy.token_source, &policy.header_name, &policy.param_name)
    }

    /// Resolves the token from HTTP headers and query/form parameters.
    /// A non-empty header wins over the parameter.
    pub fn resolve(&self, headers: &HeaderMap, params: &HashMap<String, String>) -> Option<String> {
        let from_header = || {
            headers
                .get(self.header_name.as_str())
                .and_then(|v| v.to_str().ok())
                .and_then(non_empty)
        };
        let from_param = || params.get(&self.param_name).and_then(|v| non_empty(v));

        match self.source {
            TokenSource::Header => from_header(),
            TokenSource::Param => from_param(),
            TokenSource::Any => from_header().or_else(from_param),
        }
    }

    /// Resolves the token from message headers; header names compare case-insensitively.
    pub fn resolve_message(&self, headers: &BTreeMap<String, Vec<u8>>) -> Option<String> {
        headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.header_name))
            .and_then(|(_, value)| std::str::from_utf8(value).ok())
            .and_then(non_empty)
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
