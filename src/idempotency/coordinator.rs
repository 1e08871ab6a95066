use crate::error::{AppError, ExecuteError, Result};
use crate::idempotency::cache::ResultCache;
use crate::idempotency::policy::{Mode, OperationPolicy};
use crate::idempotency::record::{validate_token, IdempotencyRecord, KeyLayout, RecordStatus};
use crate::idempotency::retry::RetryBudget;
use crate::idempotency::storage::{AcquireReply, CompleteCommand, StateStore};
use crate::observability::{get_metrics, mask_token};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-coordinator counters.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub proceeded: AtomicU64,
    pub replayed: AtomicU64,
    pub rejected: AtomicU64,
    pub unavailable: AtomicU64,
    /// Store replies that could not be interpreted.
    pub errors: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            proceeded: self.proceeded.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub proceeded: u64,
    pub replayed: u64,
    pub rejected: u64,
    pub unavailable: u64,
    pub errors: u64,
    pub completed: u64,
    pub failed: u64,
}

impl MetricsSnapshot {
    /// Share of requests that were duplicates (replayed or rejected).
    pub fn duplicate_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            (self.replayed + self.rejected) as f64 / self.total_requests as f64
        }
    }
}

/// Process-wide defaults injected at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub key_prefix: String,
    pub expire_time: Duration,
    pub max_retries: u32,
    pub strong_by_default: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            key_prefix: "idempotent:".to_string(),
            expire_time: Duration::from_secs(300),
            max_retries: 3,
            strong_by_default: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    DuplicateInFlight,
    DuplicateCompleted,
    RetryBudgetExceeded,
}

impl RejectReason {
    fn as_label(&self) -> &'static str {
        match self {
            RejectReason::DuplicateInFlight => "duplicate_in_flight",
            RejectReason::DuplicateCompleted => "duplicate_completed",
            RejectReason::RetryBudgetExceeded => "retry_budget_exceeded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
    /// Observed failures when the budget ran out.
    pub attempts: Option<u32>,
}

impl Rejection {
    fn new(reason: RejectReason, message: &str) -> Self {
        Self {
            reason,
            message: message.to_string(),
            attempts: None,
        }
    }

    pub fn into_error(self) -> AppError {
        match self.reason {
            RejectReason::DuplicateInFlight => AppError::DuplicateInFlight(self.message),
            RejectReason::DuplicateCompleted => AppError::DuplicateCompleted(self.message),
            RejectReason::RetryBudgetExceeded => AppError::RetryBudgetExceeded {
                message: self.message,
                attempts: self.attempts.unwrap_or_default(),
            },
        }
    }
}

/// Result of `acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Run the operation, then call `complete`.
    Proceed,
    /// Return this payload verbatim without running the operation.
    Replay(String),
    Reject(Rejection),
}

/// Outcome reported to `complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success(String),
    Failure,
}

/// Snapshot of a token's coordination state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenState {
    pub status: Option<RecordStatus>,
    pub has_payload: bool,
    pub retry_attempts: u32,
}

/// Brackets a protected operation with `acquire` / `complete` against the
/// shared store. Holds no per-token state of its own.
pub struct IdempotencyCoordinator {
    store: Arc<dyn StateStore>,
    config: CoordinatorConfig,
    keys: KeyLayout,
    cache: ResultCache,
    retries: RetryBudget,
    metrics: Arc<IdempotencyMetrics>,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn StateStore>, config: CoordinatorConfig) -> Self {
        let keys = KeyLayout::new(&config.key_prefix);
        let cache = ResultCache::new(Arc::clone(&store), keys.clone());
        let retries = RetryBudget::new(
            Arc::clone(&store),
            keys.clone(),
            config.max_retries,
            config.expire_time,
        );

        Self {
            store,
            config,
            keys,
            cache,
            retries,
            metrics: Arc::new(IdempotencyMetrics::new()),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn retries(&self) -> &RetryBudget {
        &self.retries
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        Arc::clone(&self.store)
    }

    fn ttl(&self, policy: &OperationPolicy) -> Duration {
        policy.expire_time.unwrap_or(self.config.expire_time)
    }

    fn is_strong(&self, policy: &OperationPolicy) -> bool {
        policy.mode.is_strong(self.config.strong_by_default)
    }

    /// Claims `token` for one execution, or explains why the caller may not run.
    ///
    /// Store failures fail closed with `AppError::StoreUnavailable`.
    pub async fn acquire(&self, token: &str, policy: &OperationPolicy) -> Result<AcquireOutcome> {
        self.acquire_owned(token, policy)
            .await
            .map(|(outcome, _owner)| outcome)
    }

    /// `acquire`, also returning the owner written into a won `PROCESSING` record.
    async fn acquire_owned(
        &self,
        token: &str,
        policy: &OperationPolicy,
    ) -> Result<(AcquireOutcome, String)> {
        let token = validate_token(token)?;
        let strong = self.is_strong(policy);
        IdempotencyMetrics::bump(&self.metrics.total_requests);

        let command = self
            .retries
            .acquire_command(token, self.ttl(policy), policy.max_retries);

        let reply = match self.store.acquire(&command).await {
            Ok(reply) => reply,
            Err(e) if e.is_unavailable() => {
                IdempotencyMetrics::bump(&self.metrics.unavailable);
                get_metrics().record_acquire("unavailable");
                error!(
                    token = %mask_token(token),
                    store = self.store.name(),
                    "Idempotency store failed during acquire: {}",
                    e
                );
                return Err(e.into_unavailable());
            }
            Err(e) => {
                IdempotencyMetrics::bump(&self.metrics.errors);
                get_metrics().record_acquire("error");
                error!(
                    token = %mask_token(token),
                    store = self.store.name(),
                    "Idempotency record could not be interpreted: {}",
                    e
                );
                return Err(e);
            }
        };

        let outcome = match reply {
            AcquireReply::Acquired => AcquireOutcome::Proceed,
            AcquireReply::Retried { attempt } => {
                info!(
                    token = %mask_token(token),
                    attempt,
                    "Retry granted after failed attempt"
                );
                AcquireOutcome::Proceed
            }
            AcquireReply::Exhausted { attempts } => AcquireOutcome::Reject(Rejection {
                attempts: Some(attempts),
                ..Rejection::new(RejectReason::RetryBudgetExceeded, &policy.message)
            }),
            AcquireReply::Existing(record) => classify(record, strong, &policy.message),
        };

        match &outcome {
            AcquireOutcome::Proceed => {
                IdempotencyMetrics::bump(&self.metrics.proceeded);
                get_metrics().record_acquire("proceed");
                debug!(token = %mask_token(token), strong, "Token acquired");
            }
            AcquireOutcome::Replay(_) => {
                IdempotencyMetrics::bump(&self.metrics.replayed);
                get_metrics().record_acquire("replay");
                debug!(token = %mask_token(token), "Replaying cached result");
            }
            AcquireOutcome::Reject(rejection) => {
                IdempotencyMetrics::bump(&self.metrics.rejected);
                get_metrics().record_acquire(rejection.reason.as_label());
                info!(
                    token = %mask_token(token),
                    reason = ?rejection.reason,
                    "Duplicate request rejected"
                );
            }
        }

        Ok((outcome, command.owner))
    }

    /// Records the outcome of an acquired execution. Returns false when the
    /// record is no longer `PROCESSING`.
    ///
    /// This two-phase form replaces whichever attempt holds the token;
    /// `execute` only ever completes its own.
    pub async fn complete(
        &self,
        token: &str,
        policy: &OperationPolicy,
        completion: Completion,
    ) -> Result<bool> {
        self.complete_owned(token, policy, completion, None).await
    }

    async fn complete_owned(
        &self,
        token: &str,
        policy: &OperationPolicy,
        completion: Completion,
        owner: Option<&str>,
    ) -> Result<bool> {
        let token = validate_token(token)?;
        let ttl = self.ttl(policy);

        let written = match completion {
            Completion::Success(payload) => {
                let written = self
                    .cache
                    .store(token, payload, self.is_strong(policy), ttl, owner)
                    .await?;
                IdempotencyMetrics::bump(&self.metrics.completed);
                get_metrics().record_completion("success");
                written
            }
            Completion::Failure => {
                let written = self
                    .store
                    .complete(&self.failure_command(token, ttl, owner))
                    .await?;
                IdempotencyMetrics::bump(&self.metrics.failed);
                get_metrics().record_completion("failure");
                written
            }
        };

        if !written {
            warn!(
                token = %mask_token(token),
                "Completion skipped: record is no longer held by this attempt"
            );
        }

        Ok(written)
    }

    fn failure_command(&self, token: &str, ttl: Duration, owner: Option<&str>) -> CompleteCommand {
        CompleteCommand {
            record_key: self.keys.record_key(token),
            counter_key: self.keys.retry_counter_key(token),
            record: IdempotencyRecord::Failed,
            ttl,
            clear_counter: false,
            owner: owner.map(str::to_string),
        }
    }

    /// Runs `operation` at most once per token.
    ///
    /// Strong-mode duplicates receive the first result deserialized from the
    /// cache; other duplicates are rejected with the policy message. Errors
    /// from `operation` are returned unchanged after the `FAILED` marker is
    /// written. If the operation panics or the returned future is dropped
    /// mid-flight, the marker is written from a background task.
    pub async fn execute<T, E, F, Fut>(
        &self,
        token: &str,
        policy: &OperationPolicy,
        operation: F,
    ) -> std::result::Result<T, ExecuteError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let (outcome, owner) = self.acquire_owned(token, policy).await?;
        match outcome {
            AcquireOutcome::Replay(payload) => {
                return serde_json::from_str(&payload)
                    .map_err(|e| ExecuteError::Idempotency(AppError::Serialization(e)));
            }
            AcquireOutcome::Reject(rejection) => {
                return Err(ExecuteError::Idempotency(rejection.into_error()));
            }
            AcquireOutcome::Proceed => {}
        }

        let token = validate_token(token)?;
        let mut guard = CompletionGuard::arm(
            self.store(),
            self.failure_command(token, self.ttl(policy), Some(&owner)),
        );

        let result = operation().await;
        guard.disarm();

        match result {
            Ok(value) => {
                let (completion_policy, payload) = if self.is_strong(policy) {
                    match serde_json::to_string(&value) {
                        Ok(payload) => (Cow::Borrowed(policy), payload),
                        Err(e) => {
                            warn!(
                                token = %mask_token(token),
                                "Result not serializable, duplicates will be rejected: {}",
                                e
                            );
                            (Cow::Owned(policy.clone().with_mode(Mode::Weak)), String::new())
                        }
                    }
                } else {
                    (Cow::Borrowed(policy), String::new())
                };

                if let Err(e) = self
                    .complete_owned(
                        token,
                        &completion_policy,
                        Completion::Success(payload),
                        Some(&owner),
                    )
                    .await
                {
                    error!(
                        token = %mask_token(token),
                        "Failed to mark idempotency token as completed: {}",
                        e
                    );
                }
                Ok(value)
            }
            Err(e) => {
                if let Err(mark_err) = self
                    .complete_owned(token, policy, Completion::Failure, Some(&owner))
                    .await
                {
                    error!(
                        token = %mask_token(token),
                        "Failed to mark idempotency token as failed: {}",
                        mark_err
                    );
                }
                Err(ExecuteError::Operation(e))
            }
        }
    }

    /// Reads the current record and retry counter for `token`.
    pub async fn inspect(&self, token: &str) -> Result<TokenState> {
        let token = validate_token(token)?;
        let record = self.cache.record(token).await?;
        let retry_attempts = self.retries.attempts(token).await?;

        Ok(TokenState {
            status: record.as_ref().map(IdempotencyRecord::status),
            has_payload: record.as_ref().and_then(IdempotencyRecord::payload).is_some(),
            retry_attempts,
        })
    }
}

fn classify(record: IdempotencyRecord, strong: bool, message: &str) -> AcquireOutcome {
    match record {
        IdempotencyRecord::Success(Some(payload)) if strong => AcquireOutcome::Replay(payload),
        IdempotencyRecord::Success(_) => {
            AcquireOutcome::Reject(Rejection::new(RejectReason::DuplicateCompleted, message))
        }
        IdempotencyRecord::Exhausted => {
            AcquireOutcome::Reject(Rejection::new(RejectReason::RetryBudgetExceeded, message))
        }
        // A FAILED record surfacing here was taken over by a concurrent caller.
        IdempotencyRecord::Processing | IdempotencyRecord::Failed => {
            AcquireOutcome::Reject(Rejection::new(RejectReason::DuplicateInFlight, message))
        }
    }
}

/// Writes the `FAILED` marker if dropped while still armed.
struct CompletionGuard {
    store: Arc<dyn StateStore>,
    command: Option<CompleteCommand>,
}

impl CompletionGuard {
    fn arm(store: Arc<dyn StateStore>, command: CompleteCommand) -> Self {
        Self {
            store,
            command: Some(command),
        }
    }

    fn disarm(&mut self) {
        self.command = None;
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let Some(command) = self.command.take() else {
            return;
        };

        get_metrics().record_guard_fallback();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = Arc::clone(&self.store);
                handle.spawn(async move {
                    if let Err(e) = store.complete(&command).await {
                        warn!(
                            key = %command.record_key,
                            "Failed to write FAILED marker after abort: {}",
                            e
                        );
                    }
                });
            }
            Err(_) => warn!(
                key = %command.record_key,
                "No runtime to write FAILED marker; record will expire via TTL"
            ),
        }
    }
}
