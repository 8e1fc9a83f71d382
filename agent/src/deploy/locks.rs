//! Per-service deployment locks
//!
//! Rollouts are serialized per `serviceName:environment`. Acquisition is a
//! single check-and-insert; the returned guard releases the key when it is
//! dropped, which covers success, error returns, panics, and cancelled
//! tasks alike.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::errors::AgentError;
use crate::models::deployment::lock_key;

/// Registry of held deployment locks
#[derive(Debug, Default)]
pub struct DeploymentLocks {
    held: Mutex<HashSet<String>>,
}

impl DeploymentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for a service/environment pair
    ///
    /// Fails fast with `ConflictError` when a rollout already holds it.
    pub fn try_acquire(
        self: &Arc<Self>,
        service_name: &str,
        environment: &str,
    ) -> Result<DeploymentLockGuard, AgentError> {
        let key = lock_key(service_name, environment);
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(key.clone()) {
            return Err(AgentError::ConflictError(key));
        }
        debug!("Acquired deployment lock {}", key);

        Ok(DeploymentLockGuard {
            registry: Arc::clone(self),
            key,
        })
    }

    pub fn is_locked(&self, service_name: &str, environment: &str) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.contains(&lock_key(service_name, environment))
    }

    /// Keys of all held locks, sorted
    pub fn held(&self) -> Vec<String> {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = held.iter().cloned().collect();
        keys.sort();
        keys
    }

    fn release(&self, key: &str) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(key);
        debug!("Released deployment lock {}", key);
    }
}

/// Held deployment lock, released on drop
#[derive(Debug)]
pub struct DeploymentLockGuard {
    registry: Arc<DeploymentLocks>,
    key: String,
}

impl DeploymentLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for DeploymentLockGuard {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_conflicts() {
        let locks = Arc::new(DeploymentLocks::new());
        let guard = locks.try_acquire("demo", "production").unwrap();
        assert_eq!(guard.key(), "demo:production");

        let err = locks.try_acquire("demo", "production").unwrap_err();
        assert!(matches!(err, AgentError::ConflictError(_)));

        // Other environments and services are independent
        let _staging = locks.try_acquire("demo", "staging").unwrap();
        let _other = locks.try_acquire("api", "production").unwrap();
        assert_eq!(locks.held().len(), 3);
    }

    #[test]
    fn test_release_on_drop() {
        let locks = Arc::new(DeploymentLocks::new());
        {
            let _guard = locks.try_acquire("demo", "production").unwrap();
            assert!(locks.is_locked("demo", "production"));
        }
        assert!(!locks.is_locked("demo", "production"));
        assert!(locks.try_acquire("demo", "production").is_ok());
    }

    #[test]
    fn test_release_on_panic() {
        let locks = Arc::new(DeploymentLocks::new());
        let cloned = Arc::clone(&locks);
        let result = std::panic::catch_unwind(move || {
            let _guard = cloned.try_acquire("demo", "production").unwrap();
            panic!("rollout blew up");
        });
        assert!(result.is_err());
        assert!(!locks.is_locked("demo", "production"));
    }

    #[test]
    fn test_guard_moves_into_task() {
        let locks = Arc::new(DeploymentLocks::new());
        let guard = locks.try_acquire("demo", "production").unwrap();

        tokio_test::block_on(async {
            let task = tokio::spawn(async move {
                tokio::task::yield_now().await;
                drop(guard);
            });
            task.await.unwrap();
        });
        assert!(locks.held().is_empty());
    }
}
