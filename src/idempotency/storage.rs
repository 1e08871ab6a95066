use crate::error::{AppError, Result};
use crate::idempotency::record::{
    processing_owner, processing_value, IdempotencyRecord, EXHAUSTED, FAILED, PROCESSING,
};
use crate::observability::{get_metrics, LatencyTimer};
use anyhow::anyhow;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

/// Everything the acquire script needs to decide a token's fate in one round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireCommand {
    pub record_key: String,
    pub counter_key: String,
    pub ttl: Duration,
    pub max_retries: u32,
    /// Written into the `PROCESSING` value so completions can be fenced.
    pub owner: String,
}

/// Outcome of the atomic acquire script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireReply {
    /// `SET NX` won; the record now holds `PROCESSING`.
    Acquired,
    /// A `FAILED` record was observed and the retry budget granted another attempt.
    Retried { attempt: u32 },
    /// A `FAILED` record was observed and the retry budget is spent.
    Exhausted { attempts: u32 },
    /// The record exists in a state that does not admit this caller.
    Existing(IdempotencyRecord),
}

/// Terminal write replacing a `PROCESSING` record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteCommand {
    pub record_key: String,
    pub counter_key: String,
    pub record: IdempotencyRecord,
    pub ttl: Duration,
    pub clear_counter: bool,
    /// When set, only the `PROCESSING` record written by this owner is replaced.
    /// When unset, any `PROCESSING` record is.
    pub owner: Option<String>,
}

impl CompleteCommand {
    /// Whether the stored value `current` may be replaced by this command.
    pub fn may_replace(&self, current: Option<&str>) -> bool {
        let Some(current) = current else {
            return true;
        };
        match &self.owner {
            Some(owner) => processing_owner(current) == Some(owner.as_str()),
            None => current == PROCESSING || processing_owner(current).is_some(),
        }
    }
}

/// Narrow view of the shared key-value store.
///
/// `acquire` and `complete` must each execute atomically on the store; the
/// remaining methods are single commands.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Name used in logs and health output.
    fn name(&self) -> &'static str;

    async fn acquire(&self, command: &AcquireCommand) -> Result<AcquireReply>;

    /// Writes the terminal record unless another attempt already owns the key.
    /// Returns false when the write was skipped.
    async fn complete(&self, command: &CompleteCommand) -> Result<bool>;

    /// Sets `key` only when it does not exist. Returns true when the value was written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Atomically increments `key` and refreshes its TTL, returning the new value.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64>;

    async fn ping(&self) -> Result<()>;
}

pub(crate) fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

// KEYS[1] record, KEYS[2] retry counter
// ARGV[1] ttl ms, ARGV[2] max retries, ARGV[3] owned PROCESSING value, ARGV[4] FAILED,
// ARGV[5] EXHAUSTED
const ACQUIRE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[3], 'NX', 'PX', ARGV[1]) then
    return {'ACQUIRED', ''}
end
local current = redis.call('GET', KEYS[1])
if current ~= ARGV[4] then
    return {'EXISTING', current or ''}
end
local attempts = redis.call('INCR', KEYS[2])
redis.call('PEXPIRE', KEYS[2], ARGV[1])
if attempts < tonumber(ARGV[2]) then
    redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[1])
    return {'RETRIED', tostring(attempts)}
end
redis.call('SET', KEYS[1], ARGV[5], 'PX', ARGV[1])
redis.call('DEL', KEYS[2])
return {'EXHAUSTED', tostring(attempts)}
"#;

// KEYS[1] record, KEYS[2] retry counter
// ARGV[1] new value, ARGV[2] ttl ms, ARGV[3] PROCESSING, ARGV[4] clear counter flag,
// ARGV[5] owned PROCESSING value or '' for any owner
const COMPLETE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current then
    if ARGV[5] ~= '' then
        if current ~= ARGV[5] then
            return 0
        end
    elseif current ~= ARGV[3] and string.sub(current, 1, #ARGV[3] + 1) ~= ARGV[3] .. ':' then
        return 0
    end
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
if ARGV[4] == '1' then
    redis.call('DEL', KEYS[2])
end
return 1
"#;

/// Redis-backed state store. Transitions run as Lua scripts so no other
/// client observes an intermediate state.
pub struct RedisStateStore {
    connection: MultiplexedConnection,
    acquire_script: redis::Script,
    complete_script: redis::Script,
}

impl RedisStateStore {
    pub async fn connect(client: &redis::Client) -> Result<Self> {
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(AppError::Redis)?;

        Ok(Self::with_connection(connection))
    }

    pub fn with_connection(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            acquire_script: redis::Script::new(ACQUIRE_SCRIPT),
            complete_script: redis::Script::new(COMPLETE_SCRIPT),
        }
    }

    fn observe<T>(operation: &str, timer: LatencyTimer, result: &redis::RedisResult<T>) {
        get_metrics().record_store_operation(operation, timer.elapsed_ms(), result.is_ok());
    }
}

fn parse_attempts(raw: &str) -> Result<u32> {
    raw.parse::<u32>()
        .map_err(|e| AppError::Internal(anyhow!("Invalid retry count '{}': {}", raw, e)))
}

#[async_trait]
impl StateStore for RedisStateStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn acquire(&self, command: &AcquireCommand) -> Result<AcquireReply> {
        let mut conn = self.connection.clone();
        let timer = LatencyTimer::new();

        let mut invocation = self.acquire_script.prepare_invoke();
        invocation
            .key(&command.record_key)
            .key(&command.counter_key)
            .arg(ttl_millis(command.ttl))
            .arg(command.max_retries)
            .arg(processing_value(&command.owner))
            .arg(FAILED)
            .arg(EXHAUSTED);

        let result: redis::RedisResult<(String, String)> = invocation.invoke_async(&mut conn).await;
        Self::observe("acquire", timer, &result);
        let (status, value) = result.map_err(AppError::Redis)?;

        match status.as_str() {
            "ACQUIRED" => Ok(AcquireReply::Acquired),
            "RETRIED" => Ok(AcquireReply::Retried {
                attempt: parse_attempts(&value)?,
            }),
            "EXHAUSTED" => Ok(AcquireReply::Exhausted {
                attempts: parse_attempts(&value)?,
            }),
            "EXISTING" => Ok(AcquireReply::Existing(IdempotencyRecord::decode(&value)?)),
            other => Err(AppError::Internal(anyhow!(
                "Unexpected acquire script status: {}",
                other
            ))),
        }
    }

    async fn complete(&self, command: &CompleteCommand) -> Result<bool> {
        let mut conn = self.connection.clone();
        let timer = LatencyTimer::new();

        let mut invocation = self.complete_script.prepare_invoke();
        invocation
            .key(&command.record_key)
            .key(&command.counter_key)
            .arg(command.record.encode())
            .arg(ttl_millis(command.ttl))
            .arg(PROCESSING)
            .arg(if command.clear_counter { "1" } else { "0" })
            .arg(
                command
                    .owner
                    .as_deref()
                    .map(processing_value)
                    .unwrap_or_default(),
            );

        let result: redis::RedisResult<i64> = invocation.invoke_async(&mut conn).await;
        Self::observe("complete", timer, &result);

        Ok(result.map_err(AppError::Redis)? == 1)
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection.clone();
        let timer = LatencyTimer::new();

        let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await;
        Self::observe("set_nx", timer, &result);

        Ok(result.map_err(AppError::Redis)?.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let timer = LatencyTimer::new();

        let result: redis::RedisResult<Option<String>> = conn.get(key).await;
        Self::observe("get", timer, &result);

        result.map_err(AppError::Redis)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let timer = LatencyTimer::new();

        let result: redis::RedisResult<i64> = conn.del(key).await;
        Self::observe("delete", timer, &result);

        Ok(result.map_err(AppError::Redis)? > 0)
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.connection.clone();
        let timer = LatencyTimer::new();

        let result: redis::RedisResult<(i64,)> = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await;
        Self::observe("incr", timer, &result);

        Ok(result.map_err(AppError::Redis)?.0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING")
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(AppError::Redis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::from_secs(300)), 300_000);
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
    }

    #[test]
    fn test_parse_attempts() {
        assert_eq!(parse_attempts("2").unwrap(), 2);
        assert!(parse_attempts("").is_err());
    }

    fn completion(owner: Option<&str>) -> CompleteCommand {
        CompleteCommand {
            record_key: "k".to_string(),
            counter_key: "k:retry:count".to_string(),
            record: IdempotencyRecord::Failed,
            ttl: Duration::from_secs(1),
            clear_counter: false,
            owner: owner.map(str::to_string),
        }
    }

    #[test]
    fn test_owned_completion_only_replaces_its_own_record() {
        let owned = completion(Some("a"));
        assert!(owned.may_replace(None));
        assert!(owned.may_replace(Some("PROCESSING:a")));
        assert!(!owned.may_replace(Some("PROCESSING:b")));
        assert!(!owned.may_replace(Some("PROCESSING")));
        assert!(!owned.may_replace(Some("FAILED")));

        let any = completion(None);
        assert!(any.may_replace(Some("PROCESSING:b")));
        assert!(any.may_replace(Some("PROCESSING")));
        assert!(!any.may_replace(Some("SUCCESS")));
        assert!(!any.may_replace(Some("PROCESSINGX")));
    }

    #[test]
    fn test_scripts_take_markers_as_arguments() {
        assert!(ACQUIRE_SCRIPT.contains("'NX', 'PX'"));
        assert!(!ACQUIRE_SCRIPT.contains(PROCESSING));
        assert!(!COMPLETE_SCRIPT.contains(PROCESSING));
    }
}
