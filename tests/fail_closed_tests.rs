use async_trait::async_trait;
use idempotency_coordinator::error::{AppError, ExecuteError, Result};
use idempotency_coordinator::idempotency::{
    AcquireCommand, AcquireReply, CompleteCommand, CoordinatorConfig, IdempotencyCoordinator,
    IdempotencyRecord, OperationPolicy, StateStore,
};
use idempotency_coordinator::observability::HealthChecker;
use mockall::mock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Store {}

    #[async_trait]
    impl StateStore for Store {
        fn name(&self) -> &'static str;
        async fn acquire(&self, command: &AcquireCommand) -> Result<AcquireReply>;
        async fn complete(&self, command: &CompleteCommand) -> Result<bool>;
        async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;
        async fn get(&self, key: &str) -> Result<Option<String>>;
        async fn delete(&self, key: &str) -> Result<bool>;
        async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64>;
        async fn ping(&self) -> Result<()>;
    }
}

fn connection_refused() -> AppError {
    AppError::Redis(redis::RedisError::from((
        redis::ErrorKind::IoError,
        "connection refused",
    )))
}

fn coordinator(store: MockStore) -> IdempotencyCoordinator {
    IdempotencyCoordinator::new(Arc::new(store), CoordinatorConfig::default())
}

#[tokio::test]
async fn test_store_failure_fails_closed() {
    let mut store = MockStore::new();
    store.expect_name().return_const("mock");
    store
        .expect_acquire()
        .times(1)
        .returning(|_| Err(connection_refused()));

    let coordinator = coordinator(store);
    let err = coordinator
        .acquire("order-1", &OperationPolicy::strong())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::StoreUnavailable(_)));
    assert!(err.is_unavailable());
    let snapshot = coordinator.metrics().snapshot();
    assert_eq!(snapshot.unavailable, 1);
    assert_eq!(snapshot.errors, 0);
}

#[tokio::test]
async fn test_unrecognised_record_is_not_counted_as_outage() {
    let mut store = MockStore::new();
    store.expect_name().return_const("mock");
    store.expect_acquire().times(1).returning(|_| {
        Err(AppError::Internal(anyhow::anyhow!(
            "Unrecognised idempotency record value: DONE"
        )))
    });

    let coordinator = coordinator(store);
    let err = coordinator
        .acquire("order-4", &OperationPolicy::weak())
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Internal(_)));
    assert!(!err.is_unavailable());
    let snapshot = coordinator.metrics().snapshot();
    assert_eq!(snapshot.unavailable, 0);
    assert_eq!(snapshot.errors, 1);
}

#[tokio::test]
async fn test_execute_does_not_run_operation_when_store_is_down() {
    let mut store = MockStore::new();
    store.expect_name().return_const("mock");
    store.expect_acquire().returning(|_| Err(connection_refused()));
    store.expect_complete().never();

    let coordinator = coordinator(store);
    let runs = AtomicU32::new(0);

    let result = coordinator
        .execute("order-1", &OperationPolicy::weak(), || async {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .await;

    assert!(matches!(
        result,
        Err(ExecuteError::Idempotency(AppError::StoreUnavailable(_)))
    ));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_acquire_sends_prefixed_keys_and_policy_ttl() {
    let mut store = MockStore::new();
    store
        .expect_acquire()
        .withf(|command: &AcquireCommand| {
            !command.owner.is_empty()
                && command.record_key == "idempotent:order-9"
                && command.counter_key == "idempotent:order-9:retry:count"
                && command.ttl == Duration::from_secs(10)
                && command.max_retries == 5
        })
        .times(1)
        .returning(|_| Ok(AcquireReply::Acquired));

    let coordinator = coordinator(store);
    let policy = OperationPolicy::weak()
        .with_expire_time(Duration::from_secs(10))
        .with_max_retries(5);

    coordinator.acquire("order-9", &policy).await.unwrap();
}

#[tokio::test]
async fn test_success_write_failure_still_returns_result() {
    let mut store = MockStore::new();
    store.expect_acquire().returning(|_| Ok(AcquireReply::Acquired));
    store
        .expect_complete()
        .withf(|command: &CompleteCommand| command.owner.is_some())
        .times(1)
        .returning(|_| Err(connection_refused()));

    let coordinator = coordinator(store);
    let value = coordinator
        .execute("order-2", &OperationPolicy::strong(), || async { Ok::<_, String>(42u32) })
        .await
        .unwrap();

    assert_eq!(value, 42);
}

#[tokio::test]
async fn test_unreadable_record_surfaces_as_error() {
    let mut store = MockStore::new();
    store
        .expect_acquire()
        .returning(|_| Ok(AcquireReply::Existing(IdempotencyRecord::Success(Some("not json".to_string())))));

    let coordinator = coordinator(store);
    let result = coordinator
        .execute("order-3", &OperationPolicy::strong(), || async { Ok::<u32, String>(1) })
        .await;

    assert!(matches!(
        result,
        Err(ExecuteError::Idempotency(AppError::Serialization(_)))
    ));
}

#[tokio::test]
async fn test_health_checker_reports_unhealthy_store() {
    let mut store = MockStore::new();
    store.expect_name().return_const("mock");
    store.expect_ping().returning(|| Err(connection_refused()));

    let checker = HealthChecker::new(Arc::new(store));
    let health = checker.check_store().await;

    assert!(health.status.is_unhealthy());
    assert!(!checker.is_ready().await);
}
