use axum::Router;
use axum::Json;
use axum::body::Body;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::routing::get;
use omni_core::config::{AppEnv, Config, LoggingConfig};
use omni_core::context::{self, RequestContext};
use omni_core::exception::{ApiError, HttpException};
use omni_core::http_exception;
use omni_server::{AppState, build_router, routes, with_pipeline};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tower::ServiceExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

static NOT_FOUND_LINE: AtomicU32 = AtomicU32::new(0);
static DIVIDE_LINE: AtomicU32 = AtomicU32::new(0);
static PARSE_LINE: AtomicU32 = AtomicU32::new(0);

fn test_state(env: AppEnv) -> AppState {
    AppState::new(Config {
        app_env: env,
        logging: LoggingConfig {
            exceptions: true,
            ..LoggingConfig::default()
        },
        ..Config::default()
    })
}

async fn show_item(Path(id): Path<u32>) -> Result<Json<Value>, ApiError> {
    if id == 7 {
        NOT_FOUND_LINE.store(line!() + 1, Ordering::SeqCst);
        return Err(http_exception!(StatusCode::NOT_FOUND, "Not found", json!({ "id": id })).into());
    }
    Ok(Json(json!({ "id": id })))
}

async fn find_order(Path(id): Path<u32>) -> Result<Json<Value>, HttpException> {
    Err(HttpException::new(format!("Order {id} not found"), StatusCode::NOT_FOUND))
}

async fn divide(Path(divisor): Path<u32>) -> Json<Value> {
    DIVIDE_LINE.store(line!() + 1, Ordering::SeqCst);
    let result = 100 / divisor;
    Json(json!({ "result": result }))
}

async fn parse_number() -> Result<Json<Value>, ApiError> {
    PARSE_LINE.store(line!() + 1, Ordering::SeqCst);
    let number: u32 = "seven".parse()?;
    Ok(Json(json!({ "number": number })))
}

async fn conflict() -> Result<Json<Value>, HttpException> {
    Err(HttpException::conflict("Email already registered"))
}

async fn current_context(Extension(ctx): Extension<RequestContext>) -> Json<Value> {
    let before = context::REQUEST_ID.get();
    tokio::time::sleep(Duration::from_millis(5)).await;
    tokio::task::yield_now().await;
    Json(json!({
        "request_id": context::REQUEST_ID.get(),
        "request_id_before_await": before,
        "extension_id": ctx.request_id,
        "method": context::METHOD.get(),
        "route": context::ROUTE.get(),
        "client_ip": context::CLIENT_IP.get(),
        "host": context::HOST.get(),
        "user_agent": context::USER_AGENT.get(),
    }))
}

fn test_router(env: AppEnv) -> Router {
    let extra = Router::new()
        .route("/items/{id}", get(show_item))
        .route("/orders/{id}", get(find_order))
        .route("/divide/{divisor}", get(divide))
        .route("/parse", get(parse_number))
        .route("/conflict", get(conflict))
        .route("/context", get(current_context));
    with_pipeline(routes().merge(extra), test_state(env))
}

/// Helper: send a GET request and return (status, headers, body as Value).
async fn send(router: &Router, uri: &str) -> (StatusCode, HeaderMap, Value) {
    send_with(router, Method::GET, uri).await
}

async fn send_with(router: &Router, method: Method, uri: &str) -> (StatusCode, HeaderMap, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("host", "api.example:8000")
        .header("user-agent", "pipeline-tests")
        .body(Body::empty())
        .unwrap();
    let response = router.clone().oneshot(request).await.expect("request failed");
    let status = response.status();
    let headers = response.headers().clone();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body");
    let value: Value = serde_json::from_slice(&body_bytes).unwrap_or(json!({}));
    (status, headers, value)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .expect("missing X-Request-ID")
        .to_str()
        .unwrap()
        .to_string()
}

fn assert_request_id(headers: &HeaderMap) {
    let id = request_id(headers);
    assert_eq!(id.len(), 16, "unexpected id {id}");
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()), "unexpected id {id}");
}

// ---------------------------------------------------------------------------
// Plain routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ping() {
    let router = build_router(test_state(AppEnv::Production));
    let (status, headers, body) = send(&router, "/test/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "message": "pong!" }));
    assert_request_id(&headers);
}

#[tokio::test]
async fn test_health() {
    let router = build_router(test_state(AppEnv::Development));
    let (status, _, body) = send(&router, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["env"], "development");
}

#[tokio::test]
async fn test_unmatched_route_still_tagged() {
    let router = build_router(test_state(AppEnv::Production));
    let (status, headers, _) = send(&router, "/nowhere").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_request_id(&headers);
}

// ---------------------------------------------------------------------------
// Context propagation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_context_visible_to_handler() {
    let router = test_router(AppEnv::Production);
    let (status, headers, body) = send(&router, "/context").await;
    assert_eq!(status, StatusCode::OK);

    let id = request_id(&headers);
    assert_eq!(body["request_id"], id);
    assert_eq!(body["request_id_before_await"], id);
    assert_eq!(body["extension_id"], id);
    assert_eq!(body["method"], "GET");
    assert_eq!(body["route"], "/context");
    assert_eq!(body["client_ip"], "unknown");
    assert_eq!(body["host"], "api.example");
    assert_eq!(body["user_agent"], "pipeline-tests");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_are_isolated() {
    let router = test_router(AppEnv::Production);

    let mut handles = Vec::new();
    for _ in 0..50 {
        let router = router.clone();
        handles.push(tokio::spawn(async move { send(&router, "/context").await }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        let (status, headers, body) = handle.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        let id = request_id(&headers);
        assert_eq!(body["request_id"], id);
        assert_eq!(body["request_id_before_await"], id);
        assert!(seen.insert(id), "request id reused");
    }
}

#[tokio::test]
async fn test_request_ids_are_unique() {
    let router = build_router(test_state(AppEnv::Production));
    let mut seen = HashSet::new();
    for _ in 0..500 {
        let (_, headers, _) = send(&router, "/test/ping").await;
        assert!(seen.insert(request_id(&headers)));
    }
}

// ---------------------------------------------------------------------------
// Structured exceptions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_structured_exception_development() {
    let router = test_router(AppEnv::Development);
    let (status, headers, body) = send(&router, "/items/7").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_request_id(&headers);

    let detail = &body["detail"];
    assert_eq!(detail["msg"], "Not found");
    assert_eq!(detail["type"], "HttpException");
    assert_eq!(detail["context"]["id"], 7);
    assert_eq!(detail["loc"]["line"], NOT_FOUND_LINE.load(Ordering::SeqCst));
    assert_eq!(detail["loc"]["function"], "show_item");
    assert_eq!(detail["loc"]["file"], "crates/server/tests/pipeline_tests.rs");
    assert_eq!(
        detail["loc"]["code"],
        r#"return Err(http_exception!(StatusCode::NOT_FOUND, "Not found", json!({ "id": id })).into());"#
    );
}

#[tokio::test]
async fn test_structured_exception_names_function_without_macro() {
    let router = test_router(AppEnv::Development);
    let (status, _, body) = send(&router, "/orders/12").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let detail = &body["detail"];
    assert_eq!(detail["msg"], "Order 12 not found");
    assert_eq!(detail["loc"]["function"], "find_order");
    assert_eq!(
        detail["loc"]["code"],
        r#"Err(HttpException::new(format!("Order {id} not found"), StatusCode::NOT_FOUND))"#
    );
}

#[tokio::test]
async fn test_structured_exception_production() {
    let router = test_router(AppEnv::Production);
    let (status, headers, body) = send(&router, "/items/7").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_request_id(&headers);
    assert_eq!(body, json!({ "detail": { "msg": "Not found", "type": "HttpException" } }));
}

#[tokio::test]
async fn test_structured_exception_returned_directly() {
    let router = test_router(AppEnv::Production);
    let (status, _, body) = send(&router, "/conflict").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["detail"]["msg"], "Email already registered");
}

#[tokio::test]
async fn test_success_passes_through() {
    let router = test_router(AppEnv::Development);
    let (status, _, body) = send(&router, "/items/3").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "id": 3 }));
}

// ---------------------------------------------------------------------------
// Unhandled failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_panic_production_is_generic() {
    let router = test_router(AppEnv::Production);
    let (status, headers, body) = send(&router, "/divide/0").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_request_id(&headers);
    assert_eq!(
        body,
        json!({ "detail": { "msg": "Internal server error", "type": "InternalServerError" } })
    );
    assert!(!body.to_string().contains("divide"));
}

#[tokio::test]
async fn test_panic_development_exposes_detail() {
    let router = test_router(AppEnv::Development);
    let (status, _, body) = send(&router, "/divide/0").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let detail = &body["detail"];
    assert_eq!(detail["msg"], "Internal server error");
    assert_eq!(detail["context"]["type_error"], "Panic");
    assert!(
        detail["context"]["exception"]
            .as_str()
            .unwrap()
            .contains("divide by zero")
    );
    assert_eq!(detail["loc"]["file"], "crates/server/tests/pipeline_tests.rs");
    assert_eq!(detail["loc"]["function"], "divide");
    assert_eq!(detail["loc"]["line"], DIVIDE_LINE.load(Ordering::SeqCst));
    assert_eq!(detail["loc"]["code"], "let result = 100 / divisor;");
}

#[tokio::test]
async fn test_propagated_error_production_is_generic() {
    let router = test_router(AppEnv::Production);
    let (status, headers, body) = send(&router, "/parse").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_request_id(&headers);
    assert!(!body.to_string().contains("invalid digit"));
}

#[tokio::test]
async fn test_propagated_error_development_exposes_detail() {
    let router = test_router(AppEnv::Development);
    let (status, _, body) = send(&router, "/parse").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let detail = &body["detail"];
    assert_eq!(detail["context"]["type_error"], "ParseIntError");
    assert_eq!(detail["context"]["exception"], "invalid digit found in string");
    assert_eq!(detail["loc"]["file"], "crates/server/tests/pipeline_tests.rs");
    assert_eq!(detail["loc"]["function"], "parse_number");
    assert_eq!(detail["loc"]["line"], PARSE_LINE.load(Ordering::SeqCst));
    assert_eq!(detail["loc"]["code"], r#"let number: u32 = "seven".parse()?;"#);
}

// ---------------------------------------------------------------------------
// Demo routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_syntax_error_route() {
    let router = build_router(test_state(AppEnv::Development));
    let (status, headers, body) = send_with(&router, Method::POST, "/test/syntax-error").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_request_id(&headers);

    let detail = &body["detail"];
    assert_eq!(detail["msg"], "Internal server error");
    assert_eq!(detail["type"], "InternalServerError");
    assert_eq!(detail["context"]["type_error"], "Error");
    assert_eq!(detail["context"]["exception"], "invalid type: null, expected i64");
    assert_eq!(detail["loc"]["file"], "crates/server/src/handler/test.rs");
    assert_eq!(detail["loc"]["function"], "syntax_error");
    assert_eq!(
        detail["loc"]["code"],
        "let threshold: i64 = serde_json::from_value(Value::Null)?;"
    );

    let router = build_router(test_state(AppEnv::Production));
    let (status, _, body) = send_with(&router, Method::POST, "/test/syntax-error").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body,
        json!({ "detail": { "msg": "Internal server error", "type": "InternalServerError" } })
    );
}

#[tokio::test]
async fn test_custom_error_route() {
    let router = build_router(test_state(AppEnv::Development));
    let (status, headers, body) = send_with(&router, Method::PUT, "/test/custom-error").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_request_id(&headers);

    let detail = &body["detail"];
    assert_eq!(detail["msg"], "Custom error");
    assert_eq!(detail["type"], "HttpException");
    assert!(detail.get("context").is_none());
    assert_eq!(detail["loc"]["file"], "crates/server/src/handler/test.rs");
    assert_eq!(detail["loc"]["function"], "custom_error");

    let router = build_router(test_state(AppEnv::Production));
    let (_, _, body) = send_with(&router, Method::PUT, "/test/custom-error").await;
    assert_eq!(body, json!({ "detail": { "msg": "Custom error", "type": "HttpException" } }));
}

#[tokio::test]
async fn test_demo_routes_reject_other_methods() {
    let router = build_router(test_state(AppEnv::Production));
    let (status, headers, _) = send(&router, "/test/custom-error").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_request_id(&headers);
}
