//! HTTP server for the authenticated proxy.
//!
//! Everything under the routing prefix is forwarded to the backend with the
//! caller's cookie credentials attached. `/session/login` and
//! `/session/logout` manage those cookies; `/health` reports liveness.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{StatusCode, header::SET_COOKIE, request::Parts},
    middleware::{self, Next},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::cache::{NoopCache, SharedResponseCache};
use crate::credentials::{
    CookieCredentialStore, CookieSettings, CredentialPair, CredentialStore, SharedCredentialStore,
};
use crate::dispatch::{
    BackendResponse, DEFAULT_EXPIRED_MESSAGE, DEFAULT_REFRESH_PATH, DEFAULT_TIMEOUT, Dispatcher,
    HttpBackend, SharedBackend,
};
use crate::error::{ProxyError, Result};
use crate::refresh::RefreshCoordinator;
use crate::response;
use crate::rewrite::{self, InboundView, SharedRewriteRule, StaticTarget};
use crate::translate::{
    CallerContext, DEFAULT_MAX_BODY_SIZE, DEFAULT_PREFIX, forward_path, has_prefix,
    translate_request,
};

/// Default path of the login page callers are redirected to.
pub const DEFAULT_LOGIN_PATH: &str = "/";

/// Configuration for the proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    /// Routing prefix stripped before forwarding.
    pub prefix: String,
    pub login_path: String,
    pub backend_url: String,
    pub refresh_path: String,
    /// Bound on every backend call, refresh included.
    pub timeout: Duration,
    pub expired_message: String,
    /// Explicit target origin; defaults to `backend_url`.
    pub target: Option<String>,
    pub change_origin: bool,
    pub cookies: CookieSettings,
    /// Peers allowed to supply their own `Authorization` header.
    pub trusted_forwarders: Vec<IpAddr>,
    pub request_logging: bool,
    pub max_body_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            prefix: DEFAULT_PREFIX.to_string(),
            login_path: DEFAULT_LOGIN_PATH.to_string(),
            backend_url: "http://127.0.0.1:8000".to_string(),
            refresh_path: DEFAULT_REFRESH_PATH.to_string(),
            timeout: DEFAULT_TIMEOUT,
            expired_message: DEFAULT_EXPIRED_MESSAGE.to_string(),
            target: None,
            change_origin: false,
            cookies: CookieSettings::default(),
            trusted_forwarders: Vec::new(),
            request_logging: true,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl ProxyConfig {
    pub fn new(backend_url: impl Into<String>) -> Self {
        Self {
            backend_url: backend_url.into(),
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_expired_message(mut self, message: impl Into<String>) -> Self {
        self.expired_message = message.into();
        self
    }

    pub fn with_target(mut self, target: Option<String>, change_origin: bool) -> Self {
        self.target = target;
        self.change_origin = change_origin;
        self
    }

    pub fn with_cookies(mut self, cookies: CookieSettings) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_trusted_forwarders(mut self, peers: Vec<IpAddr>) -> Self {
        self.trusted_forwarders = peers;
        self
    }

    pub fn with_request_logging(mut self, enabled: bool) -> Self {
        self.request_logging = enabled;
        self
    }

    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }
}

/// Shared state for request handlers.
struct ProxyState {
    config: ProxyConfig,
    dispatcher: Dispatcher,
    rewrite: SharedRewriteRule,
}

impl ProxyState {
    fn caller_context(&self, parts: &Parts) -> CallerContext {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        match peer {
            Some(ip) if self.config.trusted_forwarders.contains(&ip) => {
                CallerContext::TrustedForwarder
            }
            _ => CallerContext::Browser,
        }
    }

    fn cookie_store(&self, parts: &Parts) -> Arc<CookieCredentialStore> {
        Arc::new(CookieCredentialStore::from_headers(
            &parts.headers,
            self.config.cookies.clone(),
        ))
    }

    async fn forward(
        &self,
        parts: &Parts,
        body: Body,
        caller: CallerContext,
        store: SharedCredentialStore,
    ) -> Result<BackendResponse> {
        let prefix = &self.config.prefix;
        let forward_path = forward_path(parts, prefix);
        let view = InboundView {
            method: &parts.method,
            uri: &parts.uri,
            headers: &parts.headers,
            forward_path: &forward_path,
        };
        let target = rewrite::resolve(self.rewrite.rewrite(&view), &parts.headers)?;

        let mut request = translate_request(parts, body, prefix, self.config.max_body_size).await?;
        request.url = target.to_string();

        self.dispatcher.dispatch(request, caller, &store).await
    }

    fn login_redirect(&self, parts: &Parts) -> Response {
        let original = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let location = format!(
            "{}?login=true&redirect={}",
            self.config.login_path,
            urlencoding::encode(original)
        );
        tracing::info!(path = %parts.uri.path(), "No credentials to refresh, redirecting to login");
        Redirect::temporary(&location).into_response()
    }
}

/// The authenticated proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    backend: SharedBackend,
    cache: SharedResponseCache,
    rewrite: SharedRewriteRule,
}

impl ProxyServer {
    /// Create a proxy forwarding to `config.backend_url` over HTTP.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let backend = HttpBackend::new(&config.backend_url, &config.refresh_path, config.timeout)?;
        let target = config
            .target
            .clone()
            .unwrap_or_else(|| config.backend_url.clone());
        let rewrite = StaticTarget::new(Some(target)).with_change_origin(config.change_origin);

        Ok(Self {
            backend: Arc::new(backend),
            cache: Arc::new(NoopCache),
            rewrite: Arc::new(rewrite),
            config,
        })
    }

    /// Replace the backend, e.g. with an in-process fake.
    pub fn with_backend(mut self, backend: SharedBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Replace the rewrite rule.
    pub fn with_rewrite(mut self, rule: SharedRewriteRule) -> Self {
        self.rewrite = rule;
        self
    }

    /// Install the shared response cache invalidated on rejected credentials.
    pub fn with_cache(mut self, cache: SharedResponseCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Build the axum router.
    pub fn router(&self) -> Router {
        let coordinator = RefreshCoordinator::with_timeout(self.backend.clone(), self.config.timeout);
        let dispatcher = Dispatcher::new(self.backend.clone(), coordinator, self.cache.clone())
            .with_expired_message(self.config.expired_message.clone());
        let state = Arc::new(ProxyState {
            config: self.config.clone(),
            dispatcher,
            rewrite: self.rewrite.clone(),
        });

        Router::new()
            .route("/health", get(handle_health))
            .route("/session/login", post(handle_login))
            .route("/session/logout", post(handle_logout))
            .fallback(handle_proxy)
            .layer(middleware::from_fn_with_state(
                state.clone(),
                request_logging_middleware,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Run the proxy server.
    pub async fn run(self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, backend = %self.config.backend_url, "Starting proxy server");
        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }

    /// Run with graceful shutdown, returning the bound address.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, backend = %self.config.backend_url, "Starting proxy server");
        let router = self.router();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown)
            .await
            .ok();
        });
        Ok(local_addr)
    }
}

/// Append any cookie writes made while handling the request.
fn with_cookies(mut response: Response, store: &CookieCredentialStore) -> Response {
    for value in store.set_cookie_headers(Utc::now()) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    response
}

/// Fallback: forward anything under the prefix.
async fn handle_proxy(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    if !has_prefix(parts.uri.path(), &state.config.prefix) {
        return (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "type": "error",
                "error": { "type": "not_found", "message": "No route" }
            })),
        )
            .into_response();
    }

    let caller = state.caller_context(&parts);
    let store = state.cookie_store(&parts);

    let response = match state.forward(&parts, body, caller, store.clone()).await {
        Ok(backend) => response::into_response(backend),
        Err(ProxyError::MissingCredentials) => state.login_redirect(&parts),
        Err(e) => e.into_response(),
    };

    with_cookies(response, &store)
}

/// Handle GET /health
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "tollgate"
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

/// Handle POST /session/login
async fn handle_login(State(state): State<Arc<ProxyState>>, body: Bytes) -> Response {
    let pair = serde_json::from_slice::<LoginRequest>(&body)
        .ok()
        .and_then(|req| match (req.access_token, req.refresh_token) {
            (Some(access), Some(refresh)) if !refresh.is_empty() => {
                CredentialPair::from_tokens(&access, &refresh).ok()
            }
            _ => None,
        });

    let Some(pair) = pair else {
        tracing::warn!("Login rejected: token missing or undecodable");
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "message": "Token not Found!" })),
        )
            .into_response();
    };

    let store = CookieCredentialStore::new(state.config.cookies.clone());
    store.replace(pair);
    tracing::info!("Session established");

    with_cookies(
        Json(serde_json::json!({ "message": "Login Success!" })).into_response(),
        &store,
    )
}

/// Handle POST /session/logout
async fn handle_logout(State(state): State<Arc<ProxyState>>) -> Response {
    let store = CookieCredentialStore::new(state.config.cookies.clone());
    store.clear();
    tracing::info!("Session cleared");

    with_cookies(
        Json(serde_json::json!({ "message": "Logout Success!" })).into_response(),
        &store,
    )
}

/// Log each completed request at a level matching its status class.
async fn request_logging_middleware(
    State(state): State<Arc<ProxyState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.config.request_logging {
        return next.run(request).await;
    }

    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start = std::time::Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();

    if status.is_server_error() {
        tracing::error!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "Request completed with server error"
        );
    } else if status.is_client_error() {
        tracing::warn!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "Request completed with client error"
        );
    } else {
        tracing::info!(
            method = %method,
            path = %path,
            status = %status.as_u16(),
            duration_ms = %duration.as_millis(),
            "Request completed"
        );
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use axum::http::header::{CONTENT_TYPE, LOCATION};
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use tower::ServiceExt;

    fn jwt(exp: i64) -> String {
        let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{}}}"#, exp));
        format!("e30.{}.sig", payload)
    }

    fn test_router() -> Router {
        ProxyServer::new(ProxyConfig::new("http://127.0.0.1:9"))
            .unwrap()
            .router()
    }

    fn set_cookies(response: &Response) -> Vec<String> {
        response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    fn login_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/session/login")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let response = test_router()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_outside_prefix_is_not_found() {
        let response = test_router()
            .oneshot(Request::builder().uri("/apiary").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_login_sets_cookies() {
        let access = jwt(Utc::now().timestamp() + 600);
        let body = format!(r#"{{"accessToken":"{}","refreshToken":"R1"}}"#, access);
        let response = test_router().oneshot(login_request(&body)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].starts_with(&format!("access_token={}", access)));
        assert!(cookies[1].starts_with("refresh_token=R1"));
        assert!(cookies.iter().all(|c| c.contains("HttpOnly")));
    }

    #[tokio::test]
    async fn test_login_without_tokens_is_unprocessable() {
        for body in [
            r#"{}"#,
            r#"{"refreshToken":"R1"}"#,
            r#"{"accessToken":"not-a-jwt","refreshToken":"R1"}"#,
            "garbage",
        ] {
            let response = test_router().oneshot(login_request(body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{}", body);
            assert!(set_cookies(&response).is_empty());
        }
    }

    #[tokio::test]
    async fn test_logout_clears_cookies() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/session/logout")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let cookies = set_cookies(&response);
        assert_eq!(cookies.len(), 2);
        assert!(cookies.iter().all(|c| c.contains("Max-Age=0")));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let router = ProxyServer::new(ProxyConfig::new("http://127.0.0.1:9").with_max_body_size(8))
            .unwrap()
            .router();
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/upload")
                    .header(CONTENT_TYPE, "text/plain")
                    .body(Body::from("far more than eight bytes"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/items")
                    .header(CONTENT_TYPE, "application/json")
                    .body(Body::from("{nope"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(LOCATION).is_none());
    }
}
