use crate::error::{AppError, Result};
use crate::idempotency::record::{processing_value, IdempotencyRecord};
use crate::idempotency::retry::{RetryBudget, RetryDecision};
use crate::idempotency::storage::{AcquireCommand, AcquireReply, CompleteCommand, StateStore};
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process store with the same atomicity as the Redis scripts: every
/// transition runs inside one critical section. Expired keys are evicted
/// lazily on access.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|entries| entries.values().filter(|e| !e.is_expired(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time to live of a key.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut entries = self.lock().ok()?;
        live(&mut entries, key).map(|e| e.expires_at.saturating_duration_since(Instant::now()))
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| AppError::StoreUnavailable("memory store lock poisoned".to_string()))
    }
}

fn live<'a>(entries: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn increment(entries: &mut HashMap<String, Entry>, key: &str, ttl: Duration) -> Result<i64> {
    let current = match live(entries, key) {
        Some(entry) => entry.value.parse::<i64>().map_err(|e| {
            AppError::Internal(anyhow!("Counter '{}' holds a non-integer value: {}", key, e))
        })?,
        None => 0,
    };

    let next = current + 1;
    entries.insert(key.to_string(), Entry::new(next.to_string(), ttl));
    Ok(next)
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn acquire(&self, command: &AcquireCommand) -> Result<AcquireReply> {
        let mut entries = self.lock()?;

        let current = match live(&mut entries, &command.record_key) {
            Some(entry) => IdempotencyRecord::decode(&entry.value)?,
            None => {
                entries.insert(
                    command.record_key.clone(),
                    Entry::new(processing_value(&command.owner), command.ttl),
                );
                return Ok(AcquireReply::Acquired);
            }
        };

        if current != IdempotencyRecord::Failed {
            return Ok(AcquireReply::Existing(current));
        }

        let attempts = increment(&mut entries, &command.counter_key, command.ttl)?;
        let attempts = u32::try_from(attempts).unwrap_or(u32::MAX);

        match RetryBudget::decide(attempts, command.max_retries) {
            RetryDecision::Grant { attempt } => {
                entries.insert(
                    command.record_key.clone(),
                    Entry::new(processing_value(&command.owner), command.ttl),
                );
                Ok(AcquireReply::Retried { attempt })
            }
            RetryDecision::Deny { attempts } => {
                entries.insert(
                    command.record_key.clone(),
                    Entry::new(IdempotencyRecord::Exhausted.encode(), command.ttl),
                );
                entries.remove(&command.counter_key);
                Ok(AcquireReply::Exhausted { attempts })
            }
        }
    }

    async fn complete(&self, command: &CompleteCommand) -> Result<bool> {
        let mut entries = self.lock()?;

        let current = live(&mut entries, &command.record_key).map(|e| e.value.as_str());
        if !command.may_replace(current) {
            return Ok(false);
        }

        entries.insert(
            command.record_key.clone(),
            Entry::new(command.record.encode(), command.ttl),
        );
        if command.clear_counter {
            entries.remove(&command.counter_key);
        }
        Ok(true)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.lock()?;
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::new(value, ttl));
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.lock()?;
        Ok(live(&mut entries, key).map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut entries = self.lock()?;
        let existed = live(&mut entries, key).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut entries = self.lock()?;
        increment(&mut entries, key, ttl)
    }

    async fn ping(&self) -> Result<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(ttl: Duration) -> AcquireCommand {
        AcquireCommand {
            record_key: "t:tok".to_string(),
            counter_key: "t:tok:retry:count".to_string(),
            ttl,
            max_retries: 3,
            owner: "owner-a".to_string(),
        }
    }

    fn fail(ttl: Duration) -> CompleteCommand {
        CompleteCommand {
            record_key: "t:tok".to_string(),
            counter_key: "t:tok:retry:count".to_string(),
            record: IdempotencyRecord::Failed,
            ttl,
            clear_counter: false,
            owner: None,
        }
    }

    #[tokio::test]
    async fn test_second_acquire_sees_processing() {
        let store = MemoryStateStore::new();
        let cmd = command(Duration::from_secs(60));

        assert_eq!(store.acquire(&cmd).await.unwrap(), AcquireReply::Acquired);
        assert_eq!(
            store.acquire(&cmd).await.unwrap(),
            AcquireReply::Existing(IdempotencyRecord::Processing)
        );
    }

    #[tokio::test]
    async fn test_failed_record_walks_retry_budget() {
        let store = MemoryStateStore::new();
        let ttl = Duration::from_secs(60);
        let cmd = command(ttl);

        assert_eq!(store.acquire(&cmd).await.unwrap(), AcquireReply::Acquired);
        assert!(store.complete(&fail(ttl)).await.unwrap());
        assert_eq!(store.get("t:tok:retry:count").await.unwrap(), None);

        assert_eq!(store.acquire(&cmd).await.unwrap(), AcquireReply::Retried { attempt: 1 });
        store.complete(&fail(ttl)).await.unwrap();
        assert_eq!(store.acquire(&cmd).await.unwrap(), AcquireReply::Retried { attempt: 2 });
        store.complete(&fail(ttl)).await.unwrap();
        assert_eq!(store.acquire(&cmd).await.unwrap(), AcquireReply::Exhausted { attempts: 3 });

        assert_eq!(store.get("t:tok:retry:count").await.unwrap(), None);
        assert_eq!(
            store.acquire(&cmd).await.unwrap(),
            AcquireReply::Existing(IdempotencyRecord::Exhausted)
        );
    }

    #[tokio::test]
    async fn test_complete_skips_foreign_terminal_record() {
        let store = MemoryStateStore::new();
        let ttl = Duration::from_secs(60);
        store.acquire(&command(ttl)).await.unwrap();
        store.complete(&fail(ttl)).await.unwrap();

        let success = CompleteCommand {
            record: IdempotencyRecord::Success(None),
            clear_counter: true,
            ..fail(ttl)
        };
        assert!(!store.complete(&success).await.unwrap());
        assert_eq!(store.get("t:tok").await.unwrap().as_deref(), Some("FAILED"));
    }

    #[tokio::test]
    async fn test_late_completion_cannot_replace_new_owner() {
        let store = MemoryStateStore::new();
        let short = Duration::from_millis(20);

        store.acquire(&command(short)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = AcquireCommand {
            owner: "owner-b".to_string(),
            ..command(Duration::from_secs(60))
        };
        assert_eq!(store.acquire(&second).await.unwrap(), AcquireReply::Acquired);

        let late = CompleteCommand {
            owner: Some("owner-a".to_string()),
            ..fail(Duration::from_secs(60))
        };
        assert!(!store.complete(&late).await.unwrap());
        assert_eq!(
            store.get("t:tok").await.unwrap().as_deref(),
            Some("PROCESSING:owner-b")
        );

        let own = CompleteCommand {
            record: IdempotencyRecord::Success(None),
            owner: Some("owner-b".to_string()),
            ..fail(Duration::from_secs(60))
        };
        assert!(store.complete(&own).await.unwrap());
        assert_eq!(store.get("t:tok").await.unwrap().as_deref(), Some("SUCCESS"));
    }

    #[tokio::test]
    async fn test_expired_record_is_reacquirable() {
        let store = MemoryStateStore::new();
        let cmd = command(Duration::from_millis(20));

        assert_eq!(store.acquire(&cmd).await.unwrap(), AcquireReply::Acquired);
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(store.is_empty());
        assert_eq!(store.acquire(&cmd).await.unwrap(), AcquireReply::Acquired);
    }

    #[tokio::test]
    async fn test_incr_with_ttl_and_delete() {
        let store = MemoryStateStore::new();
        let ttl = Duration::from_secs(30);

        assert_eq!(store.incr_with_ttl("c", ttl).await.unwrap(), 1);
        assert_eq!(store.incr_with_ttl("c", ttl).await.unwrap(), 2);
        assert!(store.ttl("c").unwrap() <= ttl);
        assert!(store.delete("c").await.unwrap());
        assert!(!store.delete("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_if_absent_respects_expiry() {
        let store = MemoryStateStore::new();

        assert!(store.set_if_absent("k", "a", Duration::from_millis(20)).await.unwrap());
        assert!(!store.set_if_absent("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.set_if_absent("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));
    }
}
