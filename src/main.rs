//! Fleetdesk Cloud Server
//!
//! Remote agent command & presence server for Fleetdesk-managed devices.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     FLEETDESK CLOUD                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐  ┌─────────────┐  ┌────────────────────────┐ │
//! │  │  API      │  │  Event      │  │  Sweeps                │ │
//! │  │  Gateway  │  │  Broadcast  │  │  (expiry + presence)   │ │
//! │  │  (Axum)   │  │  (WS fanout)│  │                        │ │
//! │  └─────┬─────┘  └──────┬──────┘  └────────────┬───────────┘ │
//! │        └───────────────┼──────────────────────┘             │
//! │                        ▼                                    │
//! │                 ┌─────────────┐                             │
//! │                 │ PostgreSQL  │                             │
//! │                 └─────────────┘                             │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod config;
mod db;
mod error;
mod events;
mod handlers;
mod middleware;
mod models;
mod sweeper;
mod transport;

use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub use error::{AppError, AppResult};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "fleetdesk_cloud=debug,tower_http=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = config::Config::from_env();

    tracing::info!("Fleetdesk Cloud Server starting...");
    tracing::info!("Database: {}", config.database_url.split('@').last().unwrap_or("***"));

    // Initialize database pool
    let pool = db::create_pool(&config.database_url).await
        .expect("Failed to create database pool");

    // Run migrations
    tracing::info!("Running database migrations...");
    db::run_migrations(&pool).await
        .expect("Failed to run migrations");

    // Build application state
    let state = AppState {
        pool,
        config: config.clone(),
        events: events::EventBroadcaster::new(),
        transport: Arc::new(transport::PushTransport::new()),
    };

    // Start background sweeps
    sweeper::spawn_sweepers(state.clone());

    // Build router
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("🚀 Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: sqlx::PgPool,
    pub config: config::Config,
    pub events: events::EventBroadcaster,
    pub transport: Arc<dyn transport::CommandTransport>,
}

/// Create the main router with all routes
fn create_router(state: AppState) -> Router {
    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/health", get(handlers::health::check))
        // Agent registration (uses shared registration key)
        .route("/api/v1/agent/register", post(handlers::agent::register))
        // Heartbeats are liveness reports, not authenticated commands;
        // unknown senders are logged and dropped by the handler
        .route("/api/v1/agent/heartbeat", post(handlers::agent::heartbeat));

    // Agent routes (agent token auth)
    let agent_routes = Router::new()
        .route("/api/v1/agent/command", get(handlers::agent::pending_command))
        .route("/api/v1/agent/command/result", post(handlers::agent::execution_result))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_agent_auth
        ));

    // Operator routes (user JWT auth)
    let operator_routes = Router::new()
        // Devices
        .route("/api/v1/devices", get(handlers::devices::list))
        .route("/api/v1/devices/:id", get(handlers::devices::get))

        // Commands
        .route("/api/v1/devices/:id/command", post(handlers::commands::dispatch))
        .route("/api/v1/devices/:id/command", delete(handlers::commands::cancel))
        .route("/api/v1/devices/:id/commands", get(handlers::commands::history))

        // Event streams
        .route("/api/v1/devices/:id/events", get(handlers::events::device_events))
        .route("/api/v1/events", get(handlers::events::org_events))

        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth::require_operator_auth
        ));

    // Combine all routes
    Router::new()
        .merge(public_routes)
        .merge(agent_routes)
        .merge(operator_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        )
        .with_state(state)
}
