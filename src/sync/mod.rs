//! Concurrency primitives for the module container
//!
//! - **Lock set**: one mutual-exclusion lock per arbitrary key, used to
//!   serialize competing install/update attempts on the same identity
//! - **Upgradeable read/write lock**: the process-wide lock guarding the
//!   module database, supporting read-to-write upgrade without deadlock
//!
//! Neither primitive depends on the rest of the crate.

pub mod lock_set;
pub mod upgradeable;

pub use lock_set::{KeyGuard, LockSet};
pub use upgradeable::{
    ReadGuard, UpgradeableReadGuard, UpgradeableRwLock, UpgradedWriteGuard, WriteGuard,
};
