use crate::error::Result;
use crate::idempotency::record::{IdempotencyRecord, KeyLayout};
use crate::idempotency::storage::{CompleteCommand, StateStore};
use std::sync::Arc;
use std::time::Duration;

/// Keeps the serialized result of strongly-idempotent successes so that
/// duplicates replay the exact bytes of the first execution.
pub struct ResultCache {
    store: Arc<dyn StateStore>,
    keys: KeyLayout,
}

impl ResultCache {
    pub fn new(store: Arc<dyn StateStore>, keys: KeyLayout) -> Self {
        Self { store, keys }
    }

    /// Replaces the `PROCESSING` record with `SUCCESS` and clears the retry counter.
    /// The payload is only attached when `retain` is set (strong mode). With an
    /// `owner`, only that attempt's `PROCESSING` record is replaced.
    pub async fn store(
        &self,
        token: &str,
        payload: String,
        retain: bool,
        ttl: Duration,
        owner: Option<&str>,
    ) -> Result<bool> {
        let record = IdempotencyRecord::Success(retain.then_some(payload));

        self.store
            .complete(&CompleteCommand {
                record_key: self.keys.record_key(token),
                counter_key: self.keys.retry_counter_key(token),
                record,
                ttl,
                clear_counter: true,
                owner: owner.map(str::to_string),
            })
            .await
    }

    pub async fn fetch(&self, token: &str) -> Result<Option<String>> {
        Ok(self
            .record(token)
            .await?
            .and_then(|record| record.payload().map(str::to_string)))
    }

    pub async fn record(&self, token: &str) -> Result<Option<IdempotencyRecord>> {
        match self.store.get(&self.keys.record_key(token)).await? {
            Some(raw) => Ok(Some(IdempotencyRecord::decode(&raw)?)),
            None => Ok(None),
        }
    }
}
