mod etcd_lock;
mod redis_lock;
mod renewal;

#[cfg(test)]
pub mod memory;

use std::sync::Arc;

use user_lock_core::{DistributedLocker, LockError};

use crate::config::LockBackend;

pub use etcd_lock::{EtcdLockSettings, EtcdLocker};
pub use redis_lock::{RedisLockSettings, RedisLocker};

/// Connect to the configured lock backend.
pub async fn connect(backend: &LockBackend) -> Result<Arc<dyn DistributedLocker>, LockError> {
    match backend {
        LockBackend::Redis { addr, settings } => {
            let locker = RedisLocker::connect(addr, settings.clone()).await?;
            Ok(Arc::new(locker))
        }
        LockBackend::Etcd {
            endpoints,
            settings,
        } => {
            let locker = EtcdLocker::connect(endpoints, settings.clone()).await?;
            Ok(Arc::new(locker))
        }
    }
}
