//! In-process repository used by unit tests, with fault injection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use user_lock_core::{StorageError, User, UserFields, UserRepository, WriteResult};

#[derive(Clone, Default)]
pub struct MemoryUserRepository {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    calls: AtomicUsize,
    failing: AtomicBool,
    delay: Mutex<Duration>,
}

#[derive(Default)]
struct State {
    rows: BTreeMap<i32, User>,
    last_id: i32,
}

impl MemoryUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of storage calls made so far, pings included.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Make every subsequent call fail with a database error.
    pub fn set_failing(&self, failing: bool) {
        self.inner.failing.store(failing, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.inner.delay.lock().unwrap() = delay;
    }

    /// Enter a call: count it, apply the delay, then the failure toggle.
    async fn enter(&self) -> Result<(), StorageError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.inner.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Database("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UserRepository for MemoryUserRepository {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn insert(
        &self,
        fields: &UserFields,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StorageError> {
        self.enter().await?;
        let mut state = self.inner.state.lock().unwrap();
        state.last_id += 1;
        let id = state.last_id;
        state.rows.insert(
            id,
            User {
                id,
                name: fields.name.clone(),
                email: fields.email.clone(),
                age: fields.age,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(WriteResult {
            rows_affected: 1,
            last_insert_id: id as u64,
        })
    }

    async fn find(&self, id: i32) -> Result<Option<User>, StorageError> {
        self.enter().await?;
        // Give other tasks a chance to interleave between read and write.
        tokio::task::yield_now().await;
        Ok(self.inner.state.lock().unwrap().rows.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<User>, StorageError> {
        self.enter().await?;
        Ok(self.inner.state.lock().unwrap().rows.values().cloned().collect())
    }

    async fn update(
        &self,
        id: i32,
        fields: &UserFields,
        now: DateTime<Utc>,
    ) -> Result<WriteResult, StorageError> {
        self.enter().await?;
        tokio::task::yield_now().await;
        let mut state = self.inner.state.lock().unwrap();
        let rows_affected = match state.rows.get_mut(&id) {
            Some(user) => {
                user.name = fields.name.clone();
                user.email = fields.email.clone();
                user.age = fields.age;
                user.updated_at = now;
                1
            }
            None => 0,
        };
        Ok(WriteResult {
            rows_affected,
            last_insert_id: 0,
        })
    }

    async fn delete(&self, id: i32) -> Result<WriteResult, StorageError> {
        self.enter().await?;
        let removed = self.inner.state.lock().unwrap().rows.remove(&id);
        Ok(WriteResult {
            rows_affected: u64::from(removed.is_some()),
            last_insert_id: 0,
        })
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.enter().await
    }
}
