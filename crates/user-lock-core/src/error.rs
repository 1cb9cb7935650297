use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage operation timed out")]
    Timeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by a lock backend.
///
/// Consumers of `DistributedLocker` treat every variant as "lock unavailable";
/// the variants exist so the cause shows up in logs.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock backend error: {0}")]
    Backend(String),

    #[error("Deadline exceeded while waiting for lock {0}")]
    DeadlineExceeded(String),

    #[error("Lock {key} still contended after {attempts} attempts")]
    Contended { key: String, attempts: u32 },
}
