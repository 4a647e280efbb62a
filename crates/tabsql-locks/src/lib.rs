pub mod coordinator;
pub mod manager;
pub mod retry;

pub use coordinator::{
    ExclusiveStrategy, FileLocks, LockOptions, LockStrategy, SharedStrategy,
};
pub use manager::{HeldLock, LockGuard, LockManager, LockMode};
pub use retry::RetryPolicy;
