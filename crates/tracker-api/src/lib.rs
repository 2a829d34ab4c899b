//! # Fleet Tracker API
//!
//! GraphQL and REST surface over the tracker's query facade.
//!
//! ## Features
//!
//! - **Device Queries**: Live device state, location history, dashboard counters
//! - **Alerts**: Filtered lists, acknowledge and resolve
//! - **Geofences**: Create, toggle, delete
//! - **Subscriptions**: Device, location, alert and geofence-crossing updates
//!   via WebSocket
//! - **Provisioning**: `POST /devices` for the dashboard's add-device form
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Axum HTTP Server                         │
//! │       (GraphQL Endpoint + Playground, POST /devices)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                async-graphql Schema                         │
//! │           (QueryRoot, MutationRoot, SubscriptionRoot)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ApiContext → Tracker                        │
//! │       (reconciled state, derived alerts, event broadcast)   │
//! └─────────────────────────────────────────────────────────────┘
//!                    │                   │
//!                    ▼                   ▼
//! ┌─────────────────────────┐   ┌──────────────────────────────┐
//! │     MemoryBackend       │   │        RestBackend           │
//! │   (local runs, demos)   │   │     (hosted device store)    │
//! └─────────────────────────┘   └──────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod error;
pub mod resolvers;
pub mod schema;

use std::sync::Arc;

use async_graphql::Schema;
use async_graphql_axum::{GraphQLRequest, GraphQLResponse, GraphQLSubscription};
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, Method, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
};
use secrecy::ExposeSecret;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracker_domain::{DeviceSnapshot, ProvisionRequest};
use tracker_feed::{Backend, MemoryBackend, RestBackend, RestConfig};

pub use config::{BackendConfig, Config};
pub use context::ApiContext;
pub use error::{ApiError, ApiResult};
pub use resolvers::{MutationRoot, QueryRoot, SubscriptionRoot};

/// GraphQL schema type
pub type ApiSchema = Schema<QueryRoot, MutationRoot, SubscriptionRoot>;

/// Build the GraphQL schema with context
pub fn build_schema(ctx: ApiContext, config: &Config) -> ApiSchema {
    Schema::build(QueryRoot, MutationRoot, SubscriptionRoot)
        .data(ctx)
        .limit_depth(config.max_query_depth)
        .limit_complexity(config.max_query_complexity)
        .finish()
}

/// Construct the configured backend
///
/// # Errors
///
/// Fails when the REST client cannot be built from the given URL and key.
pub fn connect_backend(backend: &BackendConfig) -> tracker_feed::Result<Arc<dyn Backend>> {
    match backend {
        BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendConfig::Rest { url, api_key } => {
            let key = secrecy::SecretString::from(api_key.expose_secret().to_owned());
            Ok(Arc::new(RestBackend::new(RestConfig::new(url.clone(), key))?))
        }
    }
}

/// Application state for Axum handlers
#[derive(Clone)]
pub struct AppState {
    pub schema: ApiSchema,
    pub ctx: ApiContext,
}

/// GraphQL endpoint handler
pub async fn graphql_handler(
    State(state): State<AppState>,
    req: GraphQLRequest,
) -> GraphQLResponse {
    state.schema.execute(req.into_inner()).await.into()
}

/// GraphQL Playground HTML
pub async fn graphql_playground() -> impl IntoResponse {
    Html(async_graphql::http::playground_source(
        async_graphql::http::GraphQLPlaygroundConfig::new("/graphql")
            .subscription_endpoint("/graphql/ws"),
    ))
}

/// Create a device from the dashboard's add-device form
///
/// Validation problems come back as 422 with one entry per field; a backend
/// refusal comes back as 502 carrying the backend's own message.
pub async fn provision_device(
    State(state): State<AppState>,
    Json(request): Json<ProvisionRequest>,
) -> ApiResult<(StatusCode, Json<DeviceSnapshot>)> {
    let device = state.ctx.tracker.provision_device(request).await?;
    Ok((StatusCode::CREATED, Json(device)))
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": VERSION,
        "syncing": state.ctx.tracker.is_running().await,
    }))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    cors.allow_origin(AllowOrigin::list(allowed))
}

/// Build the Axum router
pub fn build_router(schema: ApiSchema, ctx: ApiContext, config: &Config) -> Router {
    let graphql = if config.enable_playground {
        get(graphql_playground).post(graphql_handler)
    } else {
        post(graphql_handler)
    };
    let state = AppState {
        schema: schema.clone(),
        ctx,
    };

    Router::new()
        // GraphQL endpoints
        .route("/graphql", graphql)
        .route_service("/graphql/ws", GraphQLSubscription::new(schema))
        // REST
        .route("/devices", post(provision_device))
        // Health check
        .route("/health", get(health_check))
        .route("/", get(|| async { "Fleet Tracker API" }))
        // State and middleware
        .with_state(state)
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
