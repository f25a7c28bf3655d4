pub mod handler;
pub mod middleware;

use axum::{Router, middleware as axum_mw};
use middleware::exception::Diagnostics;
use omni_core::config::Config;
use std::sync::Arc;
use std::time::Instant;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub diagnostics: Arc<Diagnostics>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let diagnostics = Arc::new(Diagnostics::new(&config));
        Self {
            config: Arc::new(config),
            diagnostics,
            start_time: Instant::now(),
        }
    }
}

/// Routes served by this crate.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", axum::routing::get(handler::health::health))
        .route("/test/ping", axum::routing::get(handler::test::ping))
        .route(
            "/test/syntax-error",
            axum::routing::post(handler::test::syntax_error),
        )
        .route(
            "/test/custom-error",
            axum::routing::put(handler::test::custom_error),
        )
}

pub fn build_router(state: AppState) -> Router {
    with_pipeline(routes(), state)
}

/// Wrap `routes` in the request pipeline (outer → inner): tracing, CORS,
/// request context, request logging, failure translation, body limit, panic
/// catching.
pub fn with_pipeline(routes: Router<AppState>, state: AppState) -> Router {
    omni_core::trace::install_panic_hook();
    let body_limit_bytes = state.config.body_limit_bytes();

    routes
        .layer(CatchPanicLayer::custom(
            middleware::exception::panic_response,
        ))
        .layer(RequestBodyLimitLayer::new(body_limit_bytes))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::exception::translate_failures,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::request_logging::request_logging_middleware,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::request_context::request_context_middleware,
        ))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
