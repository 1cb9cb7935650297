use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, LeaseKeepAliveStream, LeaseKeeper, LockOptions};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use user_lock_core::{
    DistributedLocker, LockError, LockGuard, LockHandle, ReleaseFuture, ResourceKey,
};

use super::renewal::RenewalTask;

/// Bound on dialing the cluster at startup.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on health check round-trips.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on unlock and lease revocation.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Key read by the health check. It does not need to exist.
const HEALTH_CHECK_KEY: &str = "healthcheck-key";

/// Tuning for the etcd session lock.
#[derive(Debug, Clone)]
pub struct EtcdLockSettings {
    /// Lease TTL backing each session; renewed every `session_ttl / 3`
    pub session_ttl: Duration,
}

impl Default for EtcdLockSettings {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(60),
        }
    }
}

/// etcd-backed session lock.
///
/// Every acquisition opens its own session (a lease kept alive by a
/// background task) and takes the etcd mutex `/{key}` under that lease. If
/// the process dies the keep-alives stop, the lease expires and etcd drops
/// the mutex.
pub struct EtcdLocker {
    client: Client,
    settings: EtcdLockSettings,
}

impl EtcdLocker {
    /// Connect to the cluster and verify it answers a read.
    pub async fn connect(endpoints: &[String], settings: EtcdLockSettings) -> Result<Self, LockError> {
        let options = ConnectOptions::new().with_connect_timeout(CONNECT_TIMEOUT);
        let client = tokio::time::timeout(CONNECT_TIMEOUT, Client::connect(endpoints, Some(options)))
            .await
            .map_err(|_| LockError::Backend(format!("Timed out connecting to etcd at {:?}", endpoints)))?
            .map_err(|e| LockError::Backend(format!("Failed to connect to etcd at {:?}: {}", endpoints, e)))?;

        let locker = Self { client, settings };
        locker.health_check().await?;

        debug!("Connected to etcd at {:?}", endpoints);
        Ok(locker)
    }

    fn session_ttl_secs(&self) -> i64 {
        self.settings.session_ttl.as_secs().max(1) as i64
    }
}

#[async_trait]
impl DistributedLocker for EtcdLocker {
    fn backend_name(&self) -> &'static str {
        "etcd"
    }

    #[instrument(skip(self, deadline), level = "debug", fields(lock_key = %key))]
    async fn acquire(&self, key: &ResourceKey, deadline: Instant) -> Result<LockGuard, LockError> {
        let name = format!("/{}", key);
        if Instant::now() >= deadline {
            return Err(LockError::DeadlineExceeded(name));
        }

        let session = match tokio::time::timeout_at(
            deadline,
            EtcdSession::open(&self.client, self.session_ttl_secs()),
        )
        .await
        {
            Err(_) => return Err(LockError::DeadlineExceeded(name)),
            Ok(Err(e)) => {
                return Err(LockError::Backend(format!(
                    "Failed to create etcd session for {}: {}",
                    name, e
                )))
            }
            Ok(Ok(session)) => session,
        };

        let mut client = self.client.clone();
        let options = LockOptions::new().with_lease(session.lease_id);
        let locked = tokio::time::timeout_at(deadline, client.lock(name.as_str(), Some(options))).await;

        match locked {
            Ok(Ok(response)) => {
                debug!("Acquired etcd lock {} (lease {:x})", name, session.lease_id);
                let handle = EtcdLockHandle {
                    client,
                    owner_key: response.key().to_vec(),
                    name,
                    session,
                };
                Ok(LockGuard::new(key.clone(), Box::new(handle)))
            }
            // The session must not outlive a failed acquisition.
            Ok(Err(e)) => {
                session.close().await;
                Err(LockError::Backend(format!("Failed to acquire etcd lock {}: {}", name, e)))
            }
            Err(_) => {
                session.close().await;
                Err(LockError::DeadlineExceeded(name))
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn health_check(&self) -> Result<(), LockError> {
        let mut client = self.client.clone();
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, client.get(HEALTH_CHECK_KEY, None))
            .await
            .map_err(|_| LockError::Backend("etcd health check timed out".to_string()))?
            .map_err(|e| LockError::Backend(format!("etcd health check failed: {}", e)))?;
        Ok(())
    }
}

/// A lease kept alive for as long as the session is open.
///
/// Dropping the session without closing it stops the keep-alives, so the
/// lease runs out at its TTL.
struct EtcdSession {
    client: Client,
    lease_id: i64,
    keep_alive: RenewalTask,
}

impl EtcdSession {
    async fn open(client: &Client, ttl_secs: i64) -> Result<Self, etcd_client::Error> {
        let mut client = client.clone();
        let lease_id = client.lease_grant(ttl_secs, None).await?.id();

        let (keeper, stream) = match client.lease_keep_alive(lease_id).await {
            Ok(channels) => channels,
            Err(e) => {
                let _ = client.lease_revoke(lease_id).await;
                return Err(e);
            }
        };

        let period = Duration::from_secs((ttl_secs / 3).max(1) as u64);
        let keep_alive = RenewalTask::spawn(keep_alive_loop(keeper, stream, lease_id, period));

        Ok(Self {
            client,
            lease_id,
            keep_alive,
        })
    }

    /// Stop renewing and revoke the lease, dropping every key attached to it.
    async fn close(mut self) {
        self.keep_alive.stop();
        match tokio::time::timeout(RELEASE_TIMEOUT, self.client.lease_revoke(self.lease_id)).await {
            Ok(Ok(_)) => debug!("Closed etcd session {:x}", self.lease_id),
            Ok(Err(e)) => warn!("Failed to revoke etcd lease {:x}: {}", self.lease_id, e),
            Err(_) => warn!("Timed out revoking etcd lease {:x}", self.lease_id),
        }
    }
}

async fn keep_alive_loop(
    mut keeper: LeaseKeeper,
    mut stream: LeaseKeepAliveStream,
    lease_id: i64,
    period: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        if let Err(e) = keeper.keep_alive().await {
            warn!("Failed to send keep-alive for etcd lease {:x}: {}", lease_id, e);
            break;
        }
        match stream.message().await {
            Ok(Some(response)) if response.ttl() > 0 => {
                debug!("Renewed etcd lease {:x} (ttl {}s)", lease_id, response.ttl())
            }
            Ok(_) => {
                warn!("etcd lease {:x} expired while held", lease_id);
                break;
            }
            Err(e) => {
                warn!("etcd keep-alive stream for lease {:x} failed: {}", lease_id, e);
                break;
            }
        }
    }
}

/// One held etcd mutex and the session that owns it.
struct EtcdLockHandle {
    client: Client,
    /// Ownership key returned by the Lock RPC, needed to unlock
    owner_key: Vec<u8>,
    name: String,
    session: EtcdSession,
}

impl LockHandle for EtcdLockHandle {
    fn release(self: Box<Self>) -> ReleaseFuture {
        Box::pin(async move {
            let EtcdLockHandle {
                mut client,
                owner_key,
                name,
                session,
            } = *self;

            // Unlock first: closing the session alone would leave the mutex
            // held until the lease ran out on the server.
            let unlocked = tokio::time::timeout(RELEASE_TIMEOUT, client.unlock(owner_key)).await;
            session.close().await;

            match unlocked {
                Ok(Ok(_)) => {
                    debug!("Released etcd lock {}", name);
                    Ok(())
                }
                Ok(Err(e)) => Err(LockError::Backend(format!(
                    "Failed to unlock etcd lock {}: {}",
                    name, e
                ))),
                Err(_) => Err(LockError::Backend(format!(
                    "Timed out unlocking etcd lock {}",
                    name
                ))),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<String> {
        std::env::var("ETCD_ENDPOINTS")
            .unwrap_or_else(|_| "http://127.0.0.1:2379".to_string())
            .split(',')
            .map(|e| e.trim().to_string())
            .collect()
    }

    #[test]
    fn test_default_session_ttl() {
        assert_eq!(
            EtcdLockSettings::default().session_ttl,
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    #[ignore = "requires etcd at ETCD_ENDPOINTS"]
    async fn test_second_acquire_waits_for_release() {
        let locker = EtcdLocker::connect(&endpoints(), EtcdLockSettings::default())
            .await
            .unwrap();
        let key = ResourceKey::new("etcd-lock-test", 1);

        let first = locker
            .acquire(&key, Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();

        let busy = locker
            .acquire(&key, Instant::now() + Duration::from_millis(300))
            .await;
        assert!(matches!(busy, Err(LockError::DeadlineExceeded(_))));

        first.release().await;

        let second = locker
            .acquire(&key, Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();
        second.release().await;
    }

    #[tokio::test]
    #[ignore = "requires etcd at ETCD_ENDPOINTS"]
    async fn test_failed_acquire_revokes_session() {
        let locker = EtcdLocker::connect(&endpoints(), EtcdLockSettings::default())
            .await
            .unwrap();
        let key = ResourceKey::new("etcd-lock-test", 2);

        let held = locker
            .acquire(&key, Instant::now() + Duration::from_secs(2))
            .await
            .unwrap();

        let mut client = locker.client.clone();
        let leases_before = client.leases().await.unwrap().leases().len();

        let busy = locker
            .acquire(&key, Instant::now() + Duration::from_millis(300))
            .await;
        assert!(busy.is_err());

        let leases_after = client.leases().await.unwrap().leases().len();
        assert_eq!(leases_before, leases_after);

        held.release().await;
    }
}
