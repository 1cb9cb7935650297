use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::LockError;

/// Namespace tag for user record locks.
pub const USER_LOCK_NAMESPACE: &str = "user-lock";

/// Name of a distributed lock, derived from a namespace and a resource id.
///
/// Renders as `{namespace}-{id}`. Backends may add their own prefix (etcd
/// keys start with `/`) but must derive it from this value only. There is no
/// constructor taking arbitrary strings, so request payloads cannot name a
/// lock outside their namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    namespace: &'static str,
    id: i64,
}

impl ResourceKey {
    pub fn new(namespace: &'static str, id: i64) -> Self {
        Self { namespace, id }
    }

    /// Key guarding the user record with the given id.
    pub fn user(id: i32) -> Self {
        Self::new(USER_LOCK_NAMESPACE, i64::from(id))
    }

    pub fn namespace(&self) -> &'static str {
        self.namespace
    }

    pub fn id(&self) -> i64 {
        self.id
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.namespace, self.id)
    }
}

/// Future returned by [`LockHandle::release`].
pub type ReleaseFuture = Pin<Box<dyn Future<Output = Result<(), LockError>> + Send + 'static>>;

/// Backend-specific state of one held lock.
///
/// Owns whatever lease or session keeps the lock alive. Consumed by
/// `release`, so it cannot be released twice.
pub trait LockHandle: Send {
    fn release(self: Box<Self>) -> ReleaseFuture;
}

/// An acquired distributed lock.
///
/// Call [`LockGuard::release`] on every exit path. If the guard is dropped
/// while still held (panic, cancelled request future) the release is spawned
/// on the current tokio runtime instead. Either way the backend handle is
/// released exactly once.
pub struct LockGuard {
    key: ResourceKey,
    handle: Option<Box<dyn LockHandle>>,
}

impl LockGuard {
    pub fn new(key: ResourceKey, handle: Box<dyn LockHandle>) -> Self {
        Self {
            key,
            handle: Some(handle),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Release the lock and wait for the backend to confirm.
    ///
    /// Release failures are logged rather than returned: the caller has
    /// already finished its critical section and the backend lease bounds how
    /// long a failed release can keep the key busy.
    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            match handle.release().await {
                Ok(()) => debug!("Released lock {}", self.key),
                Err(e) => warn!("Failed to release lock {}: {}", self.key, e),
            }
        }
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("held", &self.handle.is_some())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let key = self.key.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("Lock {} dropped while held, releasing in background", key);
                runtime.spawn(async move {
                    if let Err(e) = handle.release().await {
                        warn!("Background release of lock {} failed: {}", key, e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "Lock {} dropped outside a runtime, leaving it to expire on the backend",
                    key
                );
            }
        }
    }
}

/// Distributed lock abstraction shared by all coordination backends.
///
/// One implementation is selected at startup and shared as
/// `Arc<dyn DistributedLocker>` for the lifetime of the process.
#[async_trait]
pub trait DistributedLocker: Send + Sync {
    /// Returns the backend identifier (e.g., "redis", "etcd").
    fn backend_name(&self) -> &'static str;

    /// Block until `key` is exclusively held by the caller.
    ///
    /// Fails once `deadline` passes (immediately if it already has), when the
    /// backend cannot be reached, or when contention outlasts the backend's
    /// retry budget.
    async fn acquire(&self, key: &ResourceKey, deadline: Instant) -> Result<LockGuard, LockError>;

    /// Cheap, bounded round-trip to the backend.
    async fn health_check(&self) -> Result<(), LockError>;
}
