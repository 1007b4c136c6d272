//! Timed pessimistic locks keyed by row id or name
//!
//! [`LockTable`] is the in-process implementation of the row-lock contract:
//! one single-permit semaphore per key, bounded waits, and a held counter
//! per key. [`RowLockGuard`] releases on drop so every exit path, including
//! early `?` returns, gives the lock back.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{trace, warn};

use crate::model::{AccountId, IpAddressId, NetworkId};
use crate::repository::RepositoryError;

/// What a lock protects
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Network(NetworkId),
    IpAddress(IpAddressId),
    Account(AccountId),
    /// Cluster-wide named lock
    Named(String),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Network(id) => write!(f, "network:{}", id),
            LockKey::IpAddress(id) => write!(f, "ip:{}", id),
            LockKey::Account(id) => write!(f, "account:{}", id),
            LockKey::Named(name) => write!(f, "named:{}", name),
        }
    }
}

/// Row-lock primitive behind the repository
#[async_trait]
pub trait RowLocker: Send + Sync {
    /// Wait at most `timeout` for the lock; `Ok(false)` on timeout
    async fn acquire_row_lock(&self, key: &LockKey, timeout: Duration)
        -> Result<bool, RepositoryError>;

    fn release_row_lock(&self, key: &LockKey);

    /// Number of holders, 0 or 1
    fn held_count(&self, key: &LockKey) -> u32;
}

/// In-process lock table
#[derive(Default)]
pub struct LockTable {
    slots: DashMap<LockKey, Arc<Semaphore>>,
    held: DashMap<LockKey, u32>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys with a live slot, held or waited on
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, key: &LockKey) -> Arc<Semaphore> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }
}

#[async_trait]
impl RowLocker for LockTable {
    async fn acquire_row_lock(
        &self,
        key: &LockKey,
        timeout: Duration,
    ) -> Result<bool, RepositoryError> {
        let slot = self.slot(key);
        let result = match tokio::time::timeout(timeout, slot.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                *self.held.entry(key.clone()).or_insert(0) += 1;
                trace!("Acquired lock {}", key);
                Ok(true)
            }
            Ok(Err(e)) => Err(RepositoryError::Backend(format!(
                "lock {} closed: {}",
                key, e
            ))),
            Err(_) => {
                trace!("Timed out after {:?} waiting for lock {}", timeout, key);
                Ok(false)
            }
        };
        result
    }

    fn release_row_lock(&self, key: &LockKey) {
        let released = match self.held.get_mut(key) {
            Some(mut count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        };

        if !released {
            warn!("Release of lock {} that is not held", key);
            return;
        }
        if let Some(slot) = self.slots.get(key) {
            slot.add_permits(1);
        }
        trace!("Released lock {}", key);

        // Idle keys are dropped; a waiter still holds a clone of its slot
        self.held.remove_if(key, |_, count| *count == 0);
        self.slots.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.available_permits() == 1
        });
    }

    fn held_count(&self, key: &LockKey) -> u32 {
        self.held.get(key).map(|c| *c).unwrap_or(0)
    }
}

/// Holds a row lock until dropped
pub struct RowLockGuard {
    locker: Arc<dyn RowLocker>,
    key: LockKey,
}

impl RowLockGuard {
    /// Acquire `key`, returning `None` when the wait exceeded `timeout`
    pub async fn acquire(
        locker: Arc<dyn RowLocker>,
        key: LockKey,
        timeout: Duration,
    ) -> Result<Option<Self>, RepositoryError> {
        if locker.acquire_row_lock(&key, timeout).await? {
            Ok(Some(Self { locker, key }))
        } else {
            Ok(None)
        }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl Drop for RowLockGuard {
    fn drop(&mut self) {
        self.locker.release_row_lock(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let table = LockTable::new();
        let key = LockKey::Network(42);

        assert!(table.acquire_row_lock(&key, Duration::from_millis(10)).await.unwrap());
        assert_eq!(table.held_count(&key), 1);

        table.release_row_lock(&key);
        assert_eq!(table.held_count(&key), 0);
    }

    #[tokio::test]
    async fn test_second_acquire_times_out() {
        let table = LockTable::new();
        let key = LockKey::Network(42);

        assert!(table.acquire_row_lock(&key, Duration::from_millis(10)).await.unwrap());
        assert!(!table.acquire_row_lock(&key, Duration::from_millis(20)).await.unwrap());
        assert_eq!(table.held_count(&key), 1);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let table = LockTable::new();

        assert!(table
            .acquire_row_lock(&LockKey::Network(1), Duration::from_millis(10))
            .await
            .unwrap());
        assert!(table
            .acquire_row_lock(&LockKey::IpAddress(1), Duration::from_millis(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let table: Arc<dyn RowLocker> = Arc::new(LockTable::new());
        let key = LockKey::Named("Network.GC.Lock".to_string());

        {
            let guard = RowLockGuard::acquire(table.clone(), key.clone(), Duration::from_millis(10))
                .await
                .unwrap();
            assert!(guard.is_some());
            assert_eq!(table.held_count(&key), 1);
        }

        assert_eq!(table.held_count(&key), 0);
        let again = RowLockGuard::acquire(table.clone(), key, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let table: Arc<dyn RowLocker> = Arc::new(LockTable::new());
        let key = LockKey::Network(7);

        let guard = RowLockGuard::acquire(table.clone(), key.clone(), Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        let waiter = {
            let table = table.clone();
            let key = key.clone();
            tokio::spawn(async move {
                RowLockGuard::acquire(table, key, Duration::from_secs(2))
                    .await
                    .unwrap()
                    .is_some()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);

        assert!(waiter.await.unwrap());
        assert_eq!(table.held_count(&key), 0);
    }

    #[tokio::test]
    async fn test_idle_slots_are_evicted() {
        let table = LockTable::new();
        for id in 0..32 {
            let key = LockKey::IpAddress(id);
            assert!(table.acquire_row_lock(&key, Duration::from_millis(10)).await.unwrap());
            table.release_row_lock(&key);
        }
        assert_eq!(table.slot_count(), 0);
    }

    #[tokio::test]
    async fn test_slot_kept_while_waiter_queued() {
        let table = Arc::new(LockTable::new());
        let key = LockKey::Network(9);
        assert!(table.acquire_row_lock(&key, Duration::from_millis(10)).await.unwrap());

        let waiter = {
            let table = table.clone();
            let key = key.clone();
            tokio::spawn(async move { table.acquire_row_lock(&key, Duration::from_secs(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        table.release_row_lock(&key);
        assert!(waiter.await.unwrap().unwrap());
        assert_eq!(table.held_count(&key), 1);

        table.release_row_lock(&key);
        assert_eq!(table.slot_count(), 0);
    }

    #[test]
    fn test_release_unheld_is_harmless() {
        let table = LockTable::new();
        table.release_row_lock(&LockKey::Account(3));
        assert_eq!(table.held_count(&LockKey::Account(3)), 0);
    }
}
