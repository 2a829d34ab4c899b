//! # Fleet Tracker API Server
//!
//! Binary entry point for the tracker API service.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tracker_api::{ApiContext, BackendConfig, Config, build_router, build_schema, connect_backend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        version = tracker_api::VERSION,
        "Starting Fleet Tracker API"
    );

    // Connect the device store
    match &config.backend {
        BackendConfig::Memory => tracing::info!("Using in-memory backend"),
        BackendConfig::Rest { url, .. } => tracing::info!(%url, "Using REST backend"),
    }
    let backend = connect_backend(&config.backend)?;

    // Build API context and start following the backend
    let api_ctx = ApiContext::for_backend(backend, &config.owner_id, config.tracker.clone());
    api_ctx.tracker.start().await?;
    tracing::info!(owner_id = %config.owner_id, "Sync session started");

    // Build GraphQL schema
    let schema = build_schema(api_ctx.clone(), &config);

    tracing::info!(
        playground = config.enable_playground,
        max_depth = config.max_query_depth,
        max_complexity = config.max_query_complexity,
        "GraphQL schema built"
    );

    // Build router
    let app = build_router(schema, api_ctx.clone(), &config);

    // Start server
    let addr = config.server_addr;
    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("GraphQL endpoint at http://{}/graphql", addr);
    tracing::info!("WebSocket subscriptions at ws://{}/graphql/ws", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    api_ctx.tracker.shutdown().await;
    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        }
    }
}
