use crate::AppState;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::{extract::Request, middleware::Next, response::Response};
use omni_core::context::{self, ContextVar, RequestContext, Token};
use std::net::SocketAddr;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const UNKNOWN_CLIENT: &str = "unknown";

/// Opens the request's context scope, populates it, and tags the response
/// with `X-Request-ID`. The store is reset whether the downstream chain
/// returns, panics, or is dropped mid-flight.
pub async fn request_context_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let meta = RequestMeta::from_request(&request, state.config.trust_forwarded_headers);
    let ctx = RequestContext::new(meta.client_ip.clone());
    let request_id = ctx.request_id.clone();
    request.extensions_mut().insert(ctx);

    context::scope(async move {
        let _scope = RequestScope::enter(&request_id, &meta);
        let mut response = next.run(request).await;
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
        response
    })
    .await
}

/// Ambient values read from the inbound request. Never fails: values the
/// transport does not expose fall back to a sentinel or stay absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMeta {
    pub client_ip: String,
    pub client_host: Option<String>,
    pub method: String,
    pub route: String,
    pub host: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestMeta {
    pub fn from_request(request: &Request, trust_forwarded_headers: bool) -> Self {
        let headers = request.headers();
        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let forwarded = trust_forwarded_headers
            .then(|| forwarded_client_ip(headers))
            .flatten();

        Self {
            client_ip: forwarded
                .or_else(|| peer.clone())
                .unwrap_or_else(|| UNKNOWN_CLIENT.to_string()),
            client_host: peer,
            method: request.method().to_string(),
            route: request.uri().path().to_string(),
            host: request
                .uri()
                .host()
                .map(str::to_string)
                .or_else(|| host_header(headers)),
            user_agent: headers
                .get(header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string()),
        }
    }
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|v| !v.is_empty())
        })
}

/// Hostname from the `Host` header, without port or IPv6 brackets.
fn host_header(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::HOST)?.to_str().ok()?;
    let authority: axum::http::uri::Authority = raw.parse().ok()?;
    let host = authority.host().trim_start_matches('[').trim_end_matches(']');
    (!host.is_empty()).then(|| host.to_string())
}

/// Guard holding the restore tokens for one request's context entries.
///
/// Dropping it resets every entry it set, in reverse order.
#[derive(Debug)]
pub struct RequestScope {
    tokens: Vec<Token<String>>,
}

impl RequestScope {
    pub fn enter(request_id: &str, meta: &RequestMeta) -> Self {
        let entries: [(&'static ContextVar<String>, Option<&str>); 7] = [
            (&context::REQUEST_ID, Some(request_id)),
            (&context::CLIENT_IP, Some(meta.client_ip.as_str())),
            (&context::CLIENT_HOST, meta.client_host.as_deref()),
            (&context::METHOD, Some(meta.method.as_str())),
            (&context::ROUTE, Some(meta.route.as_str())),
            (&context::HOST, meta.host.as_deref()),
            (&context::USER_AGENT, meta.user_agent.as_deref()),
        ];

        let tokens = entries
            .into_iter()
            .filter_map(|(var, value)| {
                var.set(value?.to_string())
                    .inspect_err(|e| tracing::debug!("Skipping context entry: {e}"))
                    .ok()
            })
            .collect();
        Self { tokens }
    }
}

impl Drop for RequestScope {
    fn drop(&mut self) {
        while let Some(token) = self.tokens.pop() {
            let var = token.var();
            if let Err(e) = var.reset(token) {
                tracing::debug!("Context entry not reset: {e}");
            }
        }
    }
}
