//! Waxlog Server - Main entry point

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tracing::{info, warn};
use waxlog_common::logging::{init_logging, LogConfig};

use waxlog_server::{
    config::Config,
    db, features,
    ingest::{
        self, DownloadAdmin, DownloadJob, IngestionStateMachine, PgCatalogWriter,
        PgIngestionRepository, ProcessingJob, Scheduler,
    },
    middleware,
    sync::{
        self,
        rate_limit::RateLimitPurgeJob,
        relay::RelaySweepJob,
        PgCollectionStore, PgRateLimitStore, PgSyncSessionRepository, RateLimitBudget,
        RateLimiter, RequestRelay, SyncOrchestrator,
    },
};

/// How often unanswered relay requests are swept
const RELAY_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("waxlog-server")
        .filter_directives("waxlog_server=debug,tower_http=debug,sqlx=warn")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _log_guard = init_logging(&log_config)?;

    info!("Starting Waxlog Server");

    let config = Config::load()?;
    let ingest_config = ingest::IngestConfig::from_env().context("Invalid ingestion configuration")?;
    let sync_config = sync::SyncConfig::from_env().context("Invalid sync configuration")?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        ingest_enabled = ingest_config.enabled,
        "Configuration loaded"
    );

    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool).await?;

    let shutdown = CancellationToken::new();

    // Live sync
    let relay = RequestRelay::new(sync_config.request_timeout());
    let (events, broadcaster) = sync::spawn_broadcaster(relay.clone());
    let rate_limit_store = Arc::new(PgRateLimitStore::new(pool.clone()));
    let rate_limiter = RateLimiter::new(
        rate_limit_store.clone(),
        RateLimitBudget {
            limit: sync_config.rate_limit_requests,
            window: sync_config.rate_limit_window(),
        },
    );
    let orchestrator = SyncOrchestrator::new(
        Arc::new(PgSyncSessionRepository::new(pool.clone())),
        Arc::new(PgCollectionStore::new(pool.clone())),
        rate_limiter.clone(),
        relay.clone(),
        events,
        sync_config.clone(),
        shutdown.clone(),
    );

    let recovered = orchestrator.recover_orphans().await?;
    if recovered > 0 {
        warn!(recovered, "Paused sync sessions left behind by a previous run");
    }

    // Dump ingestion
    let machine = IngestionStateMachine::new(Arc::new(PgIngestionRepository::new(pool.clone())));
    let download_job = Arc::new(DownloadJob::new(machine.clone(), &ingest_config)?);
    let processing_job = Arc::new(ProcessingJob::new(
        machine.clone(),
        Arc::new(PgCatalogWriter::new(pool.clone())),
        &ingest_config,
    ));

    let mut scheduler = Scheduler::new(shutdown.clone());
    scheduler
        .register(Arc::new(RelaySweepJob::new(relay.clone())), RELAY_SWEEP_INTERVAL)
        .register(
            Arc::new(RateLimitPurgeJob::new(rate_limit_store)),
            sync_config.rate_limit_window(),
        );
    if ingest_config.enabled {
        scheduler
            .register(download_job.clone(), ingest_config.download_interval())
            .register(processing_job, ingest_config.processing_interval());
    } else {
        info!("Ingestion is disabled (INGEST_ENABLED=false)");
    }
    let (scheduler_handle, scheduler_task) = scheduler.start();

    let feature_state = features::FeatureState {
        orchestrator,
        rate_limiter,
        relay,
        downloads: DownloadAdmin::new(machine, download_job, scheduler_handle),
    };
    let app = create_router(pool, feature_state, &config);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    // Stop scheduled jobs and sync drivers; running sessions are paused on next start
    shutdown.cancel();
    let grace = Duration::from_secs(config.server.shutdown_timeout_secs);
    if tokio::time::timeout(grace, scheduler_task).await.is_err() {
        warn!("Job scheduler did not stop in time");
    }
    broadcaster.abort();

    info!("Server shut down gracefully");
    Ok(())
}

/// Create the application router with all routes and middleware
fn create_router(pool: sqlx::PgPool, feature_state: features::FeatureState, config: &Config) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(pool)
        .nest("/api/v1", features::router(feature_state))
        .layer(CompressionLayer::new())
        .layer(middleware::tracing_layer())
        .layer(middleware::cors_layer(&config.cors))
}

/// Health check handler
async fn health_check(State(pool): State<sqlx::PgPool>) -> Result<Response, StatusCode> {
    match db::health_check(&pool).await {
        Ok(()) => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        )
            .into_response()),
        Err(e) => {
            tracing::error!("Database health check failed: {:?}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        },
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    info!("Waiting up to {} seconds for connections to close", timeout_secs);
}
