//! Structured HTTP exceptions and the `?`-friendly error carrier.
//!
//! Business code returns [`HttpException`] for expected failures (not found,
//! conflict, validation). Anything else that reaches a handler boundary
//! through [`ApiError`] is an unhandled failure. Neither renders its final
//! body here: the response carries a [`Failure`] extension that the
//! translator middleware turns into the diagnostic body for the running mode.

use crate::trace::{self, CallSite, PanicCapture};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{Map, Value, json};
use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::Location;
use std::sync::Arc;

pub const HTTP_EXCEPTION_TYPE: &str = "HttpException";
pub const INTERNAL_ERROR_TYPE: &str = "InternalServerError";
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

/// Build an [`HttpException`] that also records the enclosing function name.
///
/// ```ignore
/// return Err(http_exception!(StatusCode::NOT_FOUND, "User not found", json!({ "id": id })).into());
/// ```
#[macro_export]
macro_rules! http_exception {
    ($status:expr, $message:expr $(,)?) => {
        $crate::exception::HttpException::new_in($crate::function_name!(), $message, $status)
    };
    ($status:expr, $message:expr, $context:expr $(,)?) => {
        $crate::exception::HttpException::new_in($crate::function_name!(), $message, $status)
            .with_context($context)
    };
}

/// A recognized, business-meaningful failure.
///
/// The call site is captured when the value is constructed and never changes
/// afterwards. Constructors other than [`http_exception!`] do not know the
/// enclosing function, so they also keep a stack to name it from.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HttpException {
    message: String,
    status: StatusCode,
    context: Option<Value>,
    loc: CallSite,
    stack: Option<Arc<Backtrace>>,
}

impl HttpException {
    #[track_caller]
    pub fn new(message: impl Into<String>, status: StatusCode) -> Self {
        Self::at(CallSite::caller(), message, status)
    }

    #[doc(hidden)]
    #[track_caller]
    pub fn new_in(function: &'static str, message: impl Into<String>, status: StatusCode) -> Self {
        Self::at(
            CallSite::from_location(Location::caller(), Some(function)),
            message,
            status,
        )
    }

    fn at(loc: CallSite, message: impl Into<String>, status: StatusCode) -> Self {
        let stack = loc
            .function
            .is_none()
            .then(|| Arc::new(Backtrace::force_capture()));
        Self {
            message: message.into(),
            status,
            context: None,
            loc,
            stack,
        }
    }

    #[track_caller]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::at(CallSite::caller(), message, StatusCode::BAD_REQUEST)
    }

    #[track_caller]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::at(CallSite::caller(), message, StatusCode::NOT_FOUND)
    }

    #[track_caller]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::at(CallSite::caller(), message, StatusCode::CONFLICT)
    }

    #[track_caller]
    pub fn unprocessable(message: impl Into<String>) -> Self {
        Self::at(CallSite::caller(), message, StatusCode::UNPROCESSABLE_ENTITY)
    }

    #[track_caller]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::at(CallSite::caller(), message, StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Attach a diagnostic payload: a map, a list or a scalar.
    pub fn with_context(mut self, context: impl Into<Value>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn context(&self) -> Option<&Value> {
        self.context.as_ref()
    }

    pub fn loc(&self) -> &CallSite {
        &self.loc
    }

    /// Rendered stack from construction, present when the call site has no
    /// function name.
    pub fn stack(&self) -> Option<String> {
        self.stack.as_deref().and_then(trace::captured)
    }

    pub fn type_name(&self) -> &'static str {
        HTTP_EXCEPTION_TYPE
    }

    /// `msg` and `type`, the part of the body shown in every mode.
    pub fn public_detail(&self) -> Map<String, Value> {
        detail(&self.message, self.type_name())
    }
}

/// Body detail for any unhandled failure, identical in every mode.
pub fn unhandled_public_detail() -> Map<String, Value> {
    detail(INTERNAL_ERROR_MESSAGE, INTERNAL_ERROR_TYPE)
}

fn detail(msg: &str, kind: &str) -> Map<String, Value> {
    let mut detail = Map::new();
    detail.insert("msg".into(), Value::from(msg));
    detail.insert("type".into(), Value::from(kind));
    detail
}

impl Default for HttpException {
    #[track_caller]
    fn default() -> Self {
        Self::internal(INTERNAL_ERROR_MESSAGE)
    }
}

impl IntoResponse for HttpException {
    fn into_response(self) -> Response {
        Failure::Structured(Arc::new(self)).into_response()
    }
}

/// A failure that is not an [`HttpException`]: a propagated error or a panic.
#[derive(Debug, Clone)]
pub struct Unhandled {
    pub type_name: String,
    pub message: String,
    /// The `?` site or panic location.
    pub origin: Option<CallSite>,
    /// Rendered std backtrace, when backtraces are enabled.
    pub backtrace: Option<String>,
}

impl Unhandled {
    /// Describe a panic caught at the handler boundary.
    ///
    /// `capture` is what the panic hook recorded; without it only the payload
    /// text is known.
    pub fn from_panic(payload: &(dyn Any + Send), capture: Option<PanicCapture>) -> Self {
        match capture {
            Some(capture) => Self {
                type_name: "Panic".to_string(),
                message: capture.message,
                origin: capture.location,
                backtrace: capture.backtrace,
            },
            None => Self {
                type_name: "Panic".to_string(),
                message: trace::panic_message(payload),
                origin: None,
                backtrace: None,
            },
        }
    }
}

/// Error type for handlers: `?` converts any error into it and records
/// where the conversion happened.
pub struct ApiError {
    error: anyhow::Error,
    type_name: &'static str,
    raised_at: &'static Location<'static>,
    stack: Option<Backtrace>,
}

impl ApiError {
    pub fn is_structured(&self) -> bool {
        self.error.is::<HttpException>()
    }

    pub fn raised_at(&self) -> &'static Location<'static> {
        self.raised_at
    }

    /// Classify into the failure the translators understand.
    pub fn into_failure(self) -> Failure {
        let Self {
            error,
            type_name,
            raised_at,
            stack,
        } = self;
        match error.downcast::<HttpException>() {
            Ok(exception) => Failure::Structured(Arc::new(exception)),
            Err(error) => Failure::Unhandled(Arc::new(Unhandled {
                type_name: type_name.to_string(),
                message: error.to_string(),
                origin: Some(CallSite::from_location(raised_at, None)),
                backtrace: stack.as_ref().and_then(trace::captured),
            })),
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error> + 'static,
{
    #[track_caller]
    fn from(error: E) -> Self {
        let type_name = trace::clean_function_name(std::any::type_name::<E>());
        let error = error.into();
        let stack = (!error.is::<HttpException>()).then(Backtrace::force_capture);
        Self {
            error,
            type_name,
            raised_at: Location::caller(),
            stack,
        }
    }
}

impl std::fmt::Debug for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiError")
            .field("type_name", &self.type_name)
            .field("error", &self.error)
            .field("raised_at", &self.raised_at)
            .finish()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.error, f)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_failure().into_response()
    }
}

/// Failure attached to a placeholder response for the translator middleware.
#[derive(Debug, Clone)]
pub enum Failure {
    Structured(Arc<HttpException>),
    Unhandled(Arc<Unhandled>),
}

impl Failure {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Structured(exception) => exception.status(),
            Self::Unhandled(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The `detail` object safe to show in any mode.
    pub fn public_detail(&self) -> Map<String, Value> {
        match self {
            Self::Structured(exception) => exception.public_detail(),
            Self::Unhandled(_) => unhandled_public_detail(),
        }
    }
}

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let body = json!({ "detail": self.public_detail() });
        let mut response = (self.status(), Json(body)).into_response();
        response.extensions_mut().insert(self);
        response
    }
}
