use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::Script;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use user_lock_core::{
    DistributedLocker, LockError, LockGuard, LockHandle, ReleaseFuture, ResourceKey,
};
use uuid::Uuid;

use super::renewal::RenewalTask;

/// Bound on the startup connection and PING.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on health check round-trips.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on the release round-trip.
const RELEASE_TIMEOUT: Duration = Duration::from_secs(2);

/// Delete the lock record only if it still carries our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Push the expiry out only if the lock record still carries our token.
const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

/// Tuning for the Redis lease lock.
#[derive(Debug, Clone)]
pub struct RedisLockSettings {
    /// Lease lifetime; renewed every `expiry / 3` while held
    pub expiry: Duration,
    /// Acquisition attempts before reporting contention
    pub tries: u32,
    pub retry_delay_min: Duration,
    pub retry_delay_max: Duration,
}

impl Default for RedisLockSettings {
    fn default() -> Self {
        Self {
            expiry: Duration::from_secs(8),
            tries: 32,
            retry_delay_min: Duration::from_millis(50),
            retry_delay_max: Duration::from_millis(250),
        }
    }
}

impl RedisLockSettings {
    /// Random delay between two acquisition attempts.
    fn retry_delay(&self) -> Duration {
        let min = self.retry_delay_min.as_millis() as u64;
        let max = (self.retry_delay_max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

/// Redis-backed lease lock.
///
/// A lock is the record `SET {key} {token} NX PX {expiry}`, where the token
/// is unique per acquisition. A watchdog task renews the lease while the
/// handle lives; release deletes the record only if the token still matches,
/// so a holder whose lease already expired cannot delete a successor's lock.
///
/// If the holder loses its connection the lease is not renewed and expires
/// after `expiry`; the next caller then acquires normally even though the
/// first one may still be inside its critical section. Lease locks cannot
/// rule this out, so writes done under this lock should be safe to retry.
pub struct RedisLocker {
    conn: ConnectionManager,
    settings: RedisLockSettings,
    release_script: Script,
    extend_script: Script,
}

impl RedisLocker {
    /// Connect to Redis and verify the connection with a PING.
    pub async fn connect(addr: &str, settings: RedisLockSettings) -> Result<Self, LockError> {
        let url = redis_url(addr);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| LockError::Backend(format!("Invalid Redis address {}: {}", addr, e)))?;

        let conn = tokio::time::timeout(CONNECT_TIMEOUT, client.get_connection_manager())
            .await
            .map_err(|_| LockError::Backend(format!("Timed out connecting to Redis at {}", addr)))?
            .map_err(|e| LockError::Backend(format!("Failed to connect to Redis at {}: {}", addr, e)))?;

        let locker = Self {
            conn,
            settings,
            release_script: Script::new(RELEASE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
        };
        locker.ping(CONNECT_TIMEOUT).await?;

        debug!("Connected to Redis at {}", addr);
        Ok(locker)
    }

    async fn ping(&self, timeout: Duration) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let _pong: String = tokio::time::timeout(timeout, redis::cmd("PING").query_async(&mut conn))
            .await
            .map_err(|_| LockError::Backend("Redis PING timed out".to_string()))?
            .map_err(|e| LockError::Backend(format!("Redis PING failed: {}", e)))?;
        Ok(())
    }

    /// One `SET NX PX` attempt. Returns whether the record was created.
    async fn try_set(&self, name: &str, token: &str, expiry: Duration) -> redis::RedisResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(name)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(expiry.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    /// Best-effort removal of a record an unfinished attempt may have set.
    ///
    /// A `SET` whose reply was lost or cut off by the deadline may still
    /// have been applied. The compare-and-delete only touches our token.
    async fn discard_attempt(&self, name: &str, token: &str) {
        let mut conn = self.conn.clone();
        let deleted: Result<redis::RedisResult<i64>, _> = tokio::time::timeout(
            RELEASE_TIMEOUT,
            self.release_script.key(name).arg(token).invoke_async(&mut conn),
        )
        .await;
        match deleted {
            Ok(Ok(0)) => {}
            Ok(Ok(_)) => debug!("Removed lease on {} left by a failed acquisition", name),
            Ok(Err(e)) => warn!("Failed to clean up lease attempt on {}: {}", name, e),
            Err(_) => warn!("Timed out cleaning up lease attempt on {}", name),
        }
    }

    fn spawn_watchdog(&self, name: String, token: String) -> RenewalTask {
        let mut conn = self.conn.clone();
        let script = self.extend_script.clone();
        let expiry = self.settings.expiry;
        let period = (expiry / 3).max(Duration::from_millis(1));

        RenewalTask::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let extended: redis::RedisResult<i64> = script
                    .key(&name)
                    .arg(&token)
                    .arg(expiry.as_millis() as u64)
                    .invoke_async(&mut conn)
                    .await;
                match extended {
                    Ok(1) => debug!("Extended lease on {}", name),
                    Ok(_) => {
                        warn!("Lease on {} was lost before release", name);
                        break;
                    }
                    // The lease keeps running down; the next tick retries.
                    Err(e) => warn!("Failed to extend lease on {}: {}", name, e),
                }
            }
        })
    }
}

#[async_trait]
impl DistributedLocker for RedisLocker {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    #[instrument(skip(self, deadline), level = "debug", fields(lock_key = %key))]
    async fn acquire(&self, key: &ResourceKey, deadline: Instant) -> Result<LockGuard, LockError> {
        let name = key.to_string();
        let token = Uuid::new_v4().to_string();
        let expiry = self.settings.expiry;
        let mut sent = 0u32;

        let result = retry_acquire(
            &name,
            self.settings.tries,
            deadline,
            || self.settings.retry_delay(),
            || {
                sent += 1;
                self.try_set(&name, &token, expiry)
            },
        )
        .await;

        match result {
            Ok(attempt) => {
                debug!("Acquired Redis lock {} on attempt {}", name, attempt);
                let watchdog = self.spawn_watchdog(name.clone(), token.clone());
                let handle = RedisLockHandle {
                    conn: self.conn.clone(),
                    release_script: self.release_script.clone(),
                    name,
                    token,
                    watchdog,
                };
                Ok(LockGuard::new(key.clone(), Box::new(handle)))
            }
            Err(e) => {
                if sent > 0 {
                    self.discard_attempt(&name, &token).await;
                }
                Err(e)
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn health_check(&self) -> Result<(), LockError> {
        self.ping(HEALTH_CHECK_TIMEOUT).await
    }
}

/// One held Redis lease.
struct RedisLockHandle {
    conn: ConnectionManager,
    release_script: Script,
    name: String,
    token: String,
    watchdog: RenewalTask,
}

impl LockHandle for RedisLockHandle {
    fn release(self: Box<Self>) -> ReleaseFuture {
        Box::pin(async move {
            let RedisLockHandle {
                mut conn,
                release_script,
                name,
                token,
                watchdog,
            } = *self;

            // Stop renewing before deleting so the lease cannot outlive us.
            watchdog.stop();

            let deleted: i64 = tokio::time::timeout(
                RELEASE_TIMEOUT,
                release_script.key(&name).arg(&token).invoke_async(&mut conn),
            )
            .await
            .map_err(|_| LockError::Backend(format!("Timed out releasing Redis lock {}", name)))?
            .map_err(|e| LockError::Backend(format!("Failed to release Redis lock {}: {}", name, e)))?;

            if deleted == 0 {
                warn!("Redis lock {} had already expired or changed hands", name);
            } else {
                debug!("Released Redis lock {}", name);
            }
            Ok(())
        })
    }
}

/// Run `attempt` until it reports the lock taken, the try budget runs out
/// or `deadline` passes. Returns the number of the winning attempt.
///
/// An attempt still in flight at the deadline is dropped. A deadline that
/// has already passed fails before the first attempt is made.
async fn retry_acquire<A, Fut>(
    name: &str,
    tries: u32,
    deadline: Instant,
    mut retry_delay: impl FnMut() -> Duration,
    mut attempt: A,
) -> Result<u32, LockError>
where
    A: FnMut() -> Fut,
    Fut: Future<Output = redis::RedisResult<bool>>,
{
    let tries = tries.max(1);
    let mut last_error = None;

    for n in 1..=tries {
        if Instant::now() >= deadline {
            return Err(LockError::DeadlineExceeded(name.to_string()));
        }

        match tokio::time::timeout_at(deadline, attempt()).await {
            Err(_) => return Err(LockError::DeadlineExceeded(name.to_string())),
            Ok(Ok(true)) => return Ok(n),
            Ok(Ok(false)) => {
                debug!("Redis lock {} busy (attempt {}/{})", name, n, tries);
                last_error = None;
            }
            Ok(Err(e)) => {
                debug!("Redis lock {} attempt {} failed: {}", name, n, e);
                last_error = Some(e);
            }
        }

        if n < tries {
            let wake = (Instant::now() + retry_delay()).min(deadline);
            tokio::time::sleep_until(wake).await;
        }
    }

    Err(match last_error {
        Some(e) => LockError::Backend(format!("Redis lock {} failed: {}", name, e)),
        None => LockError::Contended {
            key: name.to_string(),
            attempts: tries,
        },
    })
}

/// Accept bare `host:port` addresses as well as full `redis://` URLs.
fn redis_url(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("redis://{}", addr)
    }
}
