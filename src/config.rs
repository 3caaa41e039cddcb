//! Configuration for the module container
//!
//! Handles timeouts and lock behavior for container operations.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Module container configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Bounded wait for the per-identity install/update locks, in seconds.
    ///
    /// Install and update fail with a lock-timeout error rather than blocking
    /// indefinitely when another thread holds the same location or name lock.
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,

    /// Whether the per-identity locks are reentrant.
    ///
    /// In non-reentrant mode a thread re-acquiring an identity lock it already
    /// holds fails fast instead of deadlocking.
    #[serde(default)]
    pub reentrant_identity_locks: bool,
}

fn default_lock_timeout_secs() -> u64 {
    5
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 5,
            reentrant_identity_locks: false,
        }
    }
}

impl ContainerConfig {
    /// Identity lock timeout as a [`Duration`]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ContainerConfig::default();
        assert_eq!(config.lock_timeout(), Duration::from_secs(5));
        assert!(!config.reentrant_identity_locks);
    }
}
