use crate::error::Result;
use crate::idempotency::record::KeyLayout;
use crate::idempotency::storage::{AcquireCommand, StateStore};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Decision taken when a `FAILED` record is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Grant { attempt: u32 },
    Deny { attempts: u32 },
}

impl RetryDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, RetryDecision::Grant { .. })
    }
}

/// Tracks business-failure retries per token.
///
/// The counter counts observed failures: the first failure leaves it absent,
/// the attempt that next observes `FAILED` raises it to 1, and so on. An
/// observation whose post-increment value reaches `max_retries` is denied.
pub struct RetryBudget {
    store: Arc<dyn StateStore>,
    keys: KeyLayout,
    max_retries: u32,
    counter_ttl: Duration,
}

impl RetryBudget {
    pub fn new(
        store: Arc<dyn StateStore>,
        keys: KeyLayout,
        max_retries: u32,
        counter_ttl: Duration,
    ) -> Self {
        Self {
            store,
            keys,
            max_retries,
            counter_ttl,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn decide(attempts: u32, max_retries: u32) -> RetryDecision {
        if attempts < max_retries {
            RetryDecision::Grant { attempt: attempts }
        } else {
            RetryDecision::Deny { attempts }
        }
    }

    /// Builds the acquire script arguments for a fresh attempt; the budget
    /// decision runs inside the store.
    pub fn acquire_command(
        &self,
        token: &str,
        ttl: Duration,
        max_retries: Option<u32>,
    ) -> AcquireCommand {
        AcquireCommand {
            record_key: self.keys.record_key(token),
            counter_key: self.keys.retry_counter_key(token),
            ttl,
            max_retries: self.limit(max_retries),
            owner: Uuid::new_v4().to_string(),
        }
    }

    fn limit(&self, max_retries: Option<u32>) -> u32 {
        max_retries.unwrap_or(self.max_retries)
    }

    /// Counts one observed failure outside the acquire script, for admin
    /// tooling and stores without scripting. Two round trips, so not safe to
    /// race against `acquire` on the same token.
    pub async fn on_observed_failure(
        &self,
        token: &str,
        max_retries: Option<u32>,
    ) -> Result<RetryDecision> {
        let key = self.keys.retry_counter_key(token);
        let attempts = self.store.incr_with_ttl(&key, self.counter_ttl).await?;
        let decision = Self::decide(
            u32::try_from(attempts).unwrap_or(u32::MAX),
            self.limit(max_retries),
        );

        if !decision.is_granted() {
            self.store.delete(&key).await?;
        }

        Ok(decision)
    }

    pub async fn clear_on_success(&self, token: &str) -> Result<()> {
        self.store.delete(&self.keys.retry_counter_key(token)).await?;
        Ok(())
    }

    /// Current counter value; absent counts as zero.
    pub async fn attempts(&self, token: &str) -> Result<u32> {
        let raw = self.store.get(&self.keys.retry_counter_key(token)).await?;
        Ok(raw.and_then(|v| v.parse::<u32>().ok()).unwrap_or(0))
    }
}
