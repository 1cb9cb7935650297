use user_lock_core::{LockError, StorageError};

/// Errors returned by the user manager.
///
/// Lock failures of every cause collapse into `LockUnavailable`: the request
/// never reached storage and is safe to retry.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to acquire lock: {0}")]
    LockUnavailable(#[source] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Convert ServiceError to tonic::Status
pub fn service_error_to_status(err: ServiceError) -> tonic::Status {
    let message = err.to_string();
    match err {
        ServiceError::LockUnavailable(_) => tonic::Status::unavailable(message),
        ServiceError::Storage(StorageError::Timeout) => tonic::Status::deadline_exceeded(message),
        ServiceError::Storage(_) => tonic::Status::internal(message),
    }
}

/// Extension trait for converting ServiceError Result to tonic::Status Result
pub trait ServiceResultExt<T> {
    fn map_service_err(self) -> Result<T, tonic::Status>;
}

impl<T> ServiceResultExt<T> for Result<T, ServiceError> {
    fn map_service_err(self) -> Result<T, tonic::Status> {
        self.map_err(service_error_to_status)
    }
}
