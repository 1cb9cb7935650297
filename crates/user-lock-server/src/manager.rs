use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use user_lock_core::{
    DistributedLocker, ResourceKey, StorageError, User, UserFields, UserRepository,
};

use crate::error::ServiceError;

/// Applies the per-user locking protocol around storage calls.
///
/// Point reads and writes of a single user run inside that user's
/// distributed lock; create and list do not lock. Every storage call is
/// bounded by the request deadline, and the lock is released on every path
/// once it was acquired.
pub struct UserManager {
    users: Arc<dyn UserRepository>,
    locker: Arc<dyn DistributedLocker>,
}

impl UserManager {
    pub fn new(users: Arc<dyn UserRepository>, locker: Arc<dyn DistributedLocker>) -> Self {
        Self { users, locker }
    }

    /// Insert a new user. Ids are assigned by the store.
    #[instrument(skip(self, fields, deadline), level = "debug")]
    pub async fn create(&self, fields: UserFields, deadline: Instant) -> Result<User, ServiceError> {
        let now = now();
        let result = bounded(deadline, self.users.insert(&fields, now)).await?;
        let id = i32::try_from(result.last_insert_id).map_err(|_| {
            StorageError::Internal(format!(
                "generated id {} does not fit a user id",
                result.last_insert_id
            ))
        })?;

        Ok(User {
            id,
            name: fields.name,
            email: fields.email,
            age: fields.age,
            created_at: now,
            updated_at: now,
        })
    }

    #[instrument(skip(self, deadline), level = "debug")]
    pub async fn get(&self, id: i32, deadline: Instant) -> Result<Option<User>, ServiceError> {
        let users = &self.users;
        self.locked(id, deadline, move || async move { users.find(id).await })
            .await
    }

    /// All users. Best effort, no locking.
    #[instrument(skip(self, deadline), level = "debug")]
    pub async fn list(&self, deadline: Instant) -> Result<Vec<User>, ServiceError> {
        Ok(bounded(deadline, self.users.list()).await?)
    }

    /// Overwrite a user's fields and return the stored record, or `None` if
    /// no such user exists.
    #[instrument(skip(self, fields, deadline), level = "debug")]
    pub async fn update(
        &self,
        id: i32,
        fields: UserFields,
        deadline: Instant,
    ) -> Result<Option<User>, ServiceError> {
        let users = &self.users;
        self.locked(id, deadline, move || async move {
            let result = users.update(id, &fields, now()).await?;
            if result.rows_affected == 0 {
                return Ok(None);
            }
            users.find(id).await
        })
        .await
    }

    /// Read-modify-write of a single user under its lock.
    ///
    /// `f` computes the new fields from the current record. Returns `None`
    /// without writing if the user does not exist.
    #[cfg(test)]
    #[instrument(skip(self, deadline, f), level = "debug")]
    pub async fn update_with<F>(
        &self,
        id: i32,
        deadline: Instant,
        f: F,
    ) -> Result<Option<User>, ServiceError>
    where
        F: FnOnce(&User) -> UserFields + Send,
    {
        let users = &self.users;
        self.locked(id, deadline, move || async move {
            let Some(current) = users.find(id).await? else {
                return Ok(None);
            };
            let fields = f(&current);
            let result = users.update(id, &fields, now()).await?;
            if result.rows_affected == 0 {
                return Ok(None);
            }
            users.find(id).await
        })
        .await
    }

    /// Delete a user. Returns `false` if no such user existed.
    #[instrument(skip(self, deadline), level = "debug")]
    pub async fn delete(&self, id: i32, deadline: Instant) -> Result<bool, ServiceError> {
        let users = &self.users;
        self.locked(id, deadline, move || async move {
            Ok(users.delete(id).await?.rows_affected > 0)
        })
        .await
    }

    /// Run `op` while holding the lock for user `id`.
    async fn locked<T, F, Fut>(&self, id: i32, deadline: Instant, op: F) -> Result<T, ServiceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let key = ResourceKey::user(id);
        let guard = match self.locker.acquire(&key, deadline).await {
            Ok(guard) => guard,
            Err(e) => {
                warn!(
                    "Failed to acquire {} lock {}: {}",
                    self.locker.backend_name(),
                    key,
                    e
                );
                return Err(ServiceError::LockUnavailable(e));
            }
        };
        debug!("Holding lock {}", key);

        let result = bounded(deadline, op()).await;
        guard.release().await;
        result.map_err(ServiceError::from)
    }
}

/// Bound a storage call by the request deadline.
async fn bounded<T>(
    deadline: Instant,
    op: impl Future<Output = Result<T, StorageError>>,
) -> Result<T, StorageError> {
    tokio::time::timeout_at(deadline, op)
        .await
        .unwrap_or(Err(StorageError::Timeout))
}

/// Current time at the precision the store keeps.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}
