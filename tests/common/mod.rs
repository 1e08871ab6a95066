#![allow(dead_code)]

use idempotency_coordinator::idempotency::{
    CoordinatorConfig, IdempotencyCoordinator, MemoryStateStore, StateStore,
};
use std::sync::Arc;
use std::time::Duration;

pub fn test_config() -> CoordinatorConfig {
    CoordinatorConfig {
        key_prefix: format!("test:{}:", uuid::Uuid::new_v4()),
        expire_time: Duration::from_secs(30),
        max_retries: 3,
        strong_by_default: false,
    }
}

pub fn setup_coordinator() -> (Arc<MemoryStateStore>, Arc<IdempotencyCoordinator>) {
    setup_coordinator_with(test_config())
}

pub fn setup_coordinator_with(
    config: CoordinatorConfig,
) -> (Arc<MemoryStateStore>, Arc<IdempotencyCoordinator>) {
    let store = Arc::new(MemoryStateStore::new());
    let shared: Arc<dyn StateStore> = store.clone();
    let coordinator = Arc::new(IdempotencyCoordinator::new(shared, config));
    (store, coordinator)
}

pub fn unique_token() -> String {
    format!("tok-{}", uuid::Uuid::new_v4())
}
