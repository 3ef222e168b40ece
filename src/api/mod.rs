//! API layer -- axum routes, handlers, and middleware.

mod error;
mod routes;
pub mod state;

use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use self::error::ApiError;
use self::state::AppState;

/// Build the application router with all API routes.
pub fn router(state: AppState) -> Router {
    let cors = state.engine.config().api.cors;
    let app = Router::new()
        .nest("/api/v1", routes::api_routes())
        .fallback(fallback)
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

async fn fallback() -> (axum::http::StatusCode, &'static str) {
    (axum::http::StatusCode::NOT_FOUND, "not found")
}
