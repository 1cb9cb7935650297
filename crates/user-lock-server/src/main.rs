mod config;
mod error;
mod health;
mod lock;
mod manager;
mod service;
mod storage;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use user_lock_core::{DistributedLocker, UserRepository};

use config::{Config, LockBackend, LogFormat};
use health::HealthState;
use manager::UserManager;
use service::proto::user_service_server::UserServiceServer;
use service::UserServiceImpl;
use storage::{mask_dsn, MySqlUserRepository};

/// File descriptor set for gRPC reflection
pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("user_descriptor");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_logging(&config);

    info!("Starting user-lock-server v{}", env!("CARGO_PKG_VERSION"));
    info!("  MySQL: {}", mask_dsn(&config.mysql_dsn));
    info!("  Lock type: {}", config.lock_type);

    let backend = config.lock_backend()?;
    match &backend {
        LockBackend::Redis { addr, settings } => {
            info!("  Redis: {}", addr);
            info!(
                "  Lease expiry: {:?}, tries: {}",
                settings.expiry, settings.tries
            );
        }
        LockBackend::Etcd {
            endpoints,
            settings,
        } => {
            info!("  etcd: {}", endpoints.join(","));
            info!("  Session TTL: {:?}", settings.session_ttl);
        }
    }

    // Storage
    let repo = MySqlUserRepository::connect(&config.mysql_dsn)
        .await
        .with_context(|| format!("Failed to connect to MySQL at {}", mask_dsn(&config.mysql_dsn)))?;
    info!("MySQL connection established");
    repo.init_schema()
        .await
        .context("Failed to initialize database schema")?;
    let users: Arc<dyn UserRepository> = Arc::new(repo);

    // Lock backend, selected once for the lifetime of the process
    let locker: Arc<dyn DistributedLocker> = lock::connect(&backend)
        .await
        .with_context(|| format!("Failed to initialize {} lock backend", config.lock_type))?;
    info!("Lock backend {} ready", locker.backend_name());

    let shutdown_rx = create_shutdown_signal();

    // Health endpoint
    let health_state = HealthState {
        users: Arc::clone(&users),
        locker: config
            .healthcheck_external
            .enabled()
            .then(|| Arc::clone(&locker)),
    };
    let health_addr = format!("{}:{}", config.host, config.health_port);
    let listener = TcpListener::bind(&health_addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", health_addr))?;
    info!("Health check listening on http://{}/healthz", health_addr);

    let mut health_shutdown = shutdown_rx.clone();
    let health_server = tokio::spawn(async move {
        axum::serve(listener, health::router(health_state))
            .with_graceful_shutdown(async move {
                let _ = health_shutdown.wait_for(|&v| v).await;
            })
            .await
    });

    // gRPC
    let manager = Arc::new(UserManager::new(users, locker));
    let user_svc = UserServiceServer::new(UserServiceImpl::new(manager, config.request_timeout()));

    let reflection_svc = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let addr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Listening on tcp://{}", addr);

    let mut grpc_shutdown = shutdown_rx;
    Server::builder()
        .add_service(reflection_svc)
        .add_service(user_svc)
        .serve_with_shutdown(addr, async move {
            let _ = grpc_shutdown.wait_for(|&v| v).await;
        })
        .await?;

    health_server.await??;

    info!("Server shutdown complete");
    Ok(())
}

/// Filter from RUST_LOG, falling back to the configured level.
fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            match signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C, initiating shutdown"),
                Err(e) => {
                    warn!("Failed to install Ctrl+C handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
