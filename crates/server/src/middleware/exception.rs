//! Failure translators: turn the [`Failure`] attached to a placeholder
//! response into the body for the running mode, and log it.

use crate::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::{extract::Request, middleware::Next, response::IntoResponse, response::Response};
use omni_core::config::{AppEnv, Config};
use omni_core::context;
use omni_core::exception::{self, Failure, HttpException, Unhandled};
use omni_core::trace::{self, SourceResolver};
use serde_json::{Map, Value, json};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub const LOG_TARGET: &str = "omni::exceptions";

/// What the translators need from configuration.
#[derive(Debug)]
pub struct Diagnostics {
    pub log_exceptions: bool,
    pub env: AppEnv,
    pub sources: SourceResolver,
}

impl Diagnostics {
    pub fn new(config: &Config) -> Self {
        Self {
            log_exceptions: config.logging.exceptions,
            env: config.app_env,
            sources: SourceResolver::new(config.resolved_project_root()),
        }
    }
}

/// Renders failures produced anywhere below it. Must sit inside the request
/// context middleware so the correlation ID is available.
pub async fn translate_failures(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let mut response = next.run(request).await;
    match response.extensions_mut().remove::<Failure>() {
        Some(Failure::Structured(exception)) => {
            render_http_exception(&state.diagnostics, &exception)
        }
        Some(Failure::Unhandled(failure)) => render_unhandled(&state.diagnostics, &failure),
        None => response,
    }
}

/// Response for a panic caught by `CatchPanicLayer`. Rendering happens in
/// [`translate_failures`].
pub fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    let failure = Unhandled::from_panic(&*payload, trace::take_panic_capture());
    Failure::Unhandled(Arc::new(failure)).into_response()
}

fn request_id() -> String {
    context::REQUEST_ID.get().unwrap_or_else(|| "-".to_string())
}

fn detail_response(status: StatusCode, detail: Map<String, Value>) -> Response {
    (status, Json(json!({ "detail": detail }))).into_response()
}

/// Structured translator: status and message chosen by the raiser.
pub fn render_http_exception(diagnostics: &Diagnostics, exception: &HttpException) -> Response {
    let mut detail = exception.public_detail();
    let development = diagnostics.env.is_development();
    if !development && !diagnostics.log_exceptions {
        return detail_response(exception.status(), detail);
    }

    let loc = diagnostics
        .sources
        .locate(exception.loc(), exception.stack().as_deref());

    if diagnostics.log_exceptions {
        let context = exception
            .context()
            .map_or_else(|| "None".to_string(), Value::to_string);
        let line = [
            request_id(),
            format!("Exception: {}", exception.type_name()),
            format!("Message: {}", exception.message()),
            format!("Status Code: {}", exception.status().as_u16()),
            format!("Context: {context}"),
            format!("Loc: {}", serde_json::to_string(&loc).unwrap_or_default()),
        ];
        tracing::warn!(target: LOG_TARGET, "{}", line.join(" | "));
    }

    if development {
        if let Some(context) = exception.context().filter(|c| has_content(c)) {
            detail.insert("context".into(), context.clone());
        }
        detail.insert(
            "loc".into(),
            serde_json::to_value(&loc).unwrap_or(Value::Null),
        );
    }

    detail_response(exception.status(), detail)
}

/// Context worth showing: not null, `false`, zero, or an empty string, list
/// or map.
fn has_content(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Fallback translator: always a generic 500. Never panics; if building the
/// diagnostic response fails, the minimal body is returned instead.
pub fn render_unhandled(diagnostics: &Diagnostics, failure: &Unhandled) -> Response {
    match std::panic::catch_unwind(AssertUnwindSafe(|| unhandled_response(diagnostics, failure))) {
        Ok(response) => response,
        Err(_) => {
            trace::take_panic_capture();
            detail_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                exception::unhandled_public_detail(),
            )
        }
    }
}

fn unhandled_response(diagnostics: &Diagnostics, failure: &Unhandled) -> Response {
    let info = diagnostics
        .sources
        .trace_info(failure.backtrace.as_deref(), failure.origin.as_ref());
    let origin = &info.origin;

    if diagnostics.log_exceptions {
        let line = [
            request_id(),
            format!("Exception: {}", failure.type_name),
            format!("Message: UNHANDLED EXC. \"{}\"", failure.message),
            format!("File: {}", origin.file),
            format!("Function: {}", origin.function),
            format!("Line: {}", origin.line),
            format!("Code: \"{}\"", origin.code.as_deref().unwrap_or("None")),
        ];
        let full_trace = serde_json::to_string(&info.full_trace).unwrap_or_default();
        tracing::error!(target: LOG_TARGET, full_trace = %full_trace, "{}", line.join(" | "));
    } else {
        tracing::error!(
            target: LOG_TARGET,
            request_id = %request_id(),
            exception = %failure.type_name,
            file = %origin.file,
            line = origin.line,
            "Unhandled failure: {}",
            failure.message
        );
    }

    let mut detail = exception::unhandled_public_detail();
    if diagnostics.env.is_development() {
        detail.insert(
            "context".into(),
            json!({
                "type_error": failure.type_name,
                "exception": failure.message,
            }),
        );
        detail.insert(
            "loc".into(),
            serde_json::to_value(origin).unwrap_or(Value::Null),
        );
    }

    detail_response(StatusCode::INTERNAL_SERVER_ERROR, detail)
}
