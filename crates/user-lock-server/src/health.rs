//! HTTP liveness endpoint.
//!
//! - GET /healthz - Pings storage and, when enabled, the lock backend

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::warn;
use user_lock_core::{DistributedLocker, LockError, StorageError, UserRepository};

/// Bound on each dependency check.
const CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Dependencies probed by `/healthz`.
#[derive(Clone)]
pub struct HealthState {
    pub users: Arc<dyn UserRepository>,
    /// Set only when the lock backend is part of the health check
    pub locker: Option<Arc<dyn DistributedLocker>>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /healthz
pub async fn healthz(State(state): State<HealthState>) -> (StatusCode, String) {
    let db = tokio::time::timeout(CHECK_TIMEOUT, state.users.ping())
        .await
        .unwrap_or_else(|_| Err(StorageError::Timeout));
    if let Err(e) = db {
        warn!("Health check failed on {}: {}", state.users.backend_name(), e);
        return (StatusCode::INTERNAL_SERVER_ERROR, format!("db error: {}", e));
    }

    if let Some(locker) = &state.locker {
        let external = tokio::time::timeout(CHECK_TIMEOUT, locker.health_check())
            .await
            .unwrap_or_else(|_| Err(LockError::Backend("health check timed out".to_string())));
        if let Err(e) = external {
            warn!("Health check failed on {}: {}", locker.backend_name(), e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("external error: {}", e),
            );
        }
    }

    (StatusCode::OK, "ok".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::memory::MemoryLocker;
    use crate::storage::memory::MemoryUserRepository;

    fn state(repo: &MemoryUserRepository, locker: Option<&MemoryLocker>) -> HealthState {
        HealthState {
            users: Arc::new(repo.clone()),
            locker: locker.map(|l| Arc::new(l.clone()) as Arc<dyn DistributedLocker>),
        }
    }

    #[tokio::test]
    async fn test_healthy() {
        let repo = MemoryUserRepository::new();
        let locker = MemoryLocker::new();

        let (status, body) = healthz(State(state(&repo, Some(&locker)))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_db_failure() {
        let repo = MemoryUserRepository::new();
        repo.set_failing(true);

        let (status, body) = healthz(State(state(&repo, None))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("db error: "));
    }

    #[tokio::test]
    async fn test_lock_backend_only_checked_when_enabled() {
        let repo = MemoryUserRepository::new();
        let locker = MemoryLocker::new();
        locker.set_available(false);

        let (status, _) = healthz(State(state(&repo, None))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = healthz(State(state(&repo, Some(&locker)))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("external error: "));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_db_times_out() {
        let repo = MemoryUserRepository::new();
        repo.set_delay(Duration::from_secs(10));

        let (status, body) = healthz(State(state(&repo, None))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "db error: Storage operation timed out");
    }
}
