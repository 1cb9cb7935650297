//! In-process lock used by unit tests in place of a real backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use user_lock_core::{
    DistributedLocker, LockError, LockGuard, LockHandle, ReleaseFuture, ResourceKey,
};

/// Per-key tokio mutexes shared by every clone of the locker.
#[derive(Clone, Default)]
pub struct MemoryLocker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    keys: Mutex<HashMap<ResourceKey, Arc<tokio::sync::Mutex<()>>>>,
    unavailable: AtomicBool,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent acquire fail as if the backend were down.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> usize {
        self.inner.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.inner.released.load(Ordering::SeqCst)
    }

    fn mutex_for(&self, key: &ResourceKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut keys = self.inner.keys.lock().unwrap();
        Arc::clone(keys.entry(key.clone()).or_default())
    }
}

#[async_trait]
impl DistributedLocker for MemoryLocker {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn acquire(&self, key: &ResourceKey, deadline: Instant) -> Result<LockGuard, LockError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Backend("memory locker unavailable".to_string()));
        }
        if Instant::now() >= deadline {
            return Err(LockError::DeadlineExceeded(key.to_string()));
        }

        let mutex = self.mutex_for(key);
        let held = tokio::time::timeout_at(deadline, mutex.lock_owned())
            .await
            .map_err(|_| LockError::DeadlineExceeded(key.to_string()))?;

        self.inner.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LockGuard::new(
            key.clone(),
            Box::new(MemoryLockHandle {
                _held: held,
                inner: Arc::clone(&self.inner),
            }),
        ))
    }

    async fn health_check(&self) -> Result<(), LockError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Backend("memory locker unavailable".to_string()));
        }
        Ok(())
    }
}

struct MemoryLockHandle {
    _held: OwnedMutexGuard<()>,
    inner: Arc<Inner>,
}

impl LockHandle for MemoryLockHandle {
    fn release(self: Box<Self>) -> ReleaseFuture {
        Box::pin(async move {
            self.inner.released.fetch_add(1, Ordering::SeqCst);
            drop(self);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_exclusive_per_key() {
        let locker = MemoryLocker::new();
        let key = ResourceKey::user(1);

        let held = locker
            .acquire(&key, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        let busy = locker
            .acquire(&key, Instant::now() + Duration::from_millis(20))
            .await;
        assert!(matches!(busy, Err(LockError::DeadlineExceeded(_))));

        let other = locker
            .acquire(&ResourceKey::user(2), Instant::now() + Duration::from_millis(20))
            .await
            .unwrap();

        held.release().await;
        other.release().await;
        assert_eq!(locker.acquired(), 2);
        assert_eq!(locker.released(), 2);

        let again = locker
            .acquire(&key, Instant::now() + Duration::from_millis(20))
            .await
            .unwrap();
        again.release().await;
    }
}
