pub mod cache;
pub mod coordinator;
pub mod memory;
pub mod policy;
pub mod record;
pub mod retry;
pub mod storage;
pub mod token;

pub use cache::ResultCache;
pub use coordinator::{
    AcquireOutcome, Completion, CoordinatorConfig, IdempotencyCoordinator, IdempotencyMetrics,
    MetricsSnapshot, RejectReason, Rejection, TokenState,
};
pub use memory::MemoryStateStore;
pub use policy::{Mode, OperationPolicy, TokenSource};
pub use record::{IdempotencyRecord, KeyLayout, RecordStatus};
pub use retry::{RetryBudget, RetryDecision};
pub use storage::{AcquireCommand, AcquireReply, CompleteCommand, RedisStateStore, StateStore};
pub use token::TokenResolver;
