//! syncdb server - streams database changes to browsers.
//!
//! This crate wires the change sources and the broadcast hub of
//! `syncdb-core` to an HTTP surface:
//! - `GET /stream` - Server-Sent Events, one `message` event per change (Basic auth)
//! - `GET /health` - hub counters and source status
//! - `GET /` - the bundled index page

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod sources;
pub mod state;

use axum::{middleware, Router};
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeFile,
    trace::TraceLayer,
};

use crate::state::AppState;

pub use config::{Args, Credentials, ServerConfig};
pub use error::AppError;
pub use sources::{configured_sources, SourceRegistry, SourceStatus};

/// Create the Axum router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let stream = routes::stream::routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_basic_auth,
    ));

    Router::new()
        .merge(routes::health::routes())
        .merge(stream)
        .route_service("/", ServeFile::new(&state.index_file))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
