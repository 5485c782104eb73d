//! Project locking: durable lock records plus the try-lock/unlock layer over them.

pub mod locker;
pub mod store;

pub use locker::{ProjectLocker, TryLockOutcome};
pub use store::{LockStore, SaveOutcome, SqliteLockStore};
