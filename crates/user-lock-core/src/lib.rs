//! Core traits and types for the user-lock service.
//!
//! This crate defines the abstractions shared between the server, its lock
//! backends and its storage backends:
//! - `DistributedLocker`: Per-key mutual exclusion across service replicas
//! - `LockGuard`: Exclusive ownership of one acquired lock
//! - `UserRepository`: Durable storage of user records

mod error;
mod lock;
mod storage;

pub use error::{LockError, StorageError};
pub use lock::{
    DistributedLocker, LockGuard, LockHandle, ReleaseFuture, ResourceKey, USER_LOCK_NAMESPACE,
};
pub use storage::{User, UserFields, UserRepository, WriteResult};
