use crate::AppState;
use axum::extract::State;
use axum::{extract::Request, middleware::Next, response::Response};
use omni_core::context::{self, RequestContext};

/// Middleware that logs request entry and completion with context info.
pub async fn request_logging_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let logging = &state.config.logging;
    if !logging.middleware {
        return next.run(request).await;
    }

    let request_id = context::REQUEST_ID.get().unwrap_or_default();
    let client_ip = context::CLIENT_IP
        .get()
        .unwrap_or_else(|| "-".to_string());
    let method = request.method().clone();
    let uri = request.uri().path().to_string();
    let started = request.extensions().get::<RequestContext>().cloned();

    if logging.middleware_show_headers {
        let headers: Vec<String> = request
            .headers()
            .iter()
            .map(|(name, value)| format!("{name}: {}", value.to_str().unwrap_or("<binary>")))
            .collect();
        tracing::info!(
            request_id = %request_id,
            client_ip = %client_ip,
            method = %method,
            path = %uri,
            headers = ?headers,
            "Request received"
        );
    } else {
        tracing::info!(
            request_id = %request_id,
            client_ip = %client_ip,
            method = %method,
            path = %uri,
            "Request received"
        );
    }

    let response = next.run(request).await;

    let elapsed = started.as_ref().map(|c| c.elapsed_ms()).unwrap_or(0);
    let status = response.status().as_u16();

    if status >= 500 {
        tracing::warn!(
            request_id = %request_id,
            status = status,
            elapsed_ms = elapsed,
            "Request failed"
        );
    } else {
        tracing::info!(
            request_id = %request_id,
            status = status,
            elapsed_ms = elapsed,
            "Request completed"
        );
    }

    response
}
