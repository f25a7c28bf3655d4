use crate::AppState;
use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "app": state.config.app_name,
        "env": state.config.app_env.to_string(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}
