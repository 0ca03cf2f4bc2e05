//! Authenticated dispatch to the backend API.
//!
//! [`Dispatcher`] attaches the caller's access credential, sends the request
//! through a [`Backend`], and classifies the outcome. Expired-token failures
//! are handed to the [`RefreshCoordinator`]; every other outcome is surfaced
//! as-is.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::SharedResponseCache;
use crate::credentials::{CredentialPair, Credentials, SharedCredentialStore};
use crate::error::{ProxyError, Result};
use crate::refresh::RefreshCoordinator;
use crate::rewrite::graft;
use crate::translate::{CallerContext, OutboundRequest};

/// Default refresh endpoint path.
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// Default `message` a backend uses to report an expired access token.
pub const DEFAULT_EXPIRED_MESSAGE: &str = "Token expired";

/// Default timeout for backend calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Backend response
// ============================================================================

/// A fully buffered backend response.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    /// Reason phrase, when the backend sent a non-canonical one.
    pub reason: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl BackendResponse {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    /// Body parsed as JSON, if it is JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// The top-level `message` field of a JSON body.
    pub fn message(&self) -> Option<String> {
        self.json()?
            .get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
    }

    /// Read a reqwest response to completion.
    pub async fn from_reqwest(response: reqwest::Response) -> Result<Self> {
        let status = response.status();
        let reason = response
            .extensions()
            .get::<hyper::ext::ReasonPhrase>()
            .map(|phrase| String::from_utf8_lossy(phrase.as_bytes()).into_owned())
            .filter(|phrase| Some(phrase.as_str()) != status.canonical_reason());
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(Self {
            status,
            reason,
            headers,
            body,
        })
    }
}

// ============================================================================
// Classification
// ============================================================================

/// What a backend response means for the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    /// 401 carrying the configured expiry message.
    TokenExpired,
    /// Any other 401.
    Unauthorized,
    Failure,
}

/// Classify a backend response by status and parsed body.
pub fn classify(
    status: StatusCode,
    body: Option<&serde_json::Value>,
    expired_message: &str,
) -> ResponseClass {
    if status == StatusCode::UNAUTHORIZED {
        let message = body
            .and_then(|b| b.get("message"))
            .and_then(|m| m.as_str());
        if message == Some(expired_message) {
            ResponseClass::TokenExpired
        } else {
            ResponseClass::Unauthorized
        }
    } else if status.as_u16() < 400 {
        ResponseClass::Success
    } else {
        ResponseClass::Failure
    }
}

impl BackendResponse {
    pub fn classify(&self, expired_message: &str) -> ResponseClass {
        classify(self.status, self.json().as_ref(), expired_message)
    }
}

// ============================================================================
// Backend trait
// ============================================================================

/// New credentials returned by the refresh endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// The backend API behind the proxy.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    /// Send one request. `Err` means no response was obtained.
    async fn send(&self, request: &OutboundRequest) -> Result<BackendResponse>;

    /// Exchange the current pair for a new one.
    async fn refresh(&self, pair: &CredentialPair) -> Result<TokenPair>;
}

/// Shared backend for use across async contexts.
pub type SharedBackend = Arc<dyn Backend>;

/// [`Backend`] over HTTP via reqwest.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: Url,
    refresh_path: String,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(base_url: &str, refresh_path: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            refresh_path: refresh_path.into(),
            timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Absolute URLs pass through; relative ones hang off the base URL.
    fn resolve(&self, url: &str) -> Result<Url> {
        match Url::parse(url) {
            Ok(absolute) => Ok(absolute),
            Err(url::ParseError::RelativeUrlWithoutBase) => graft(self.base_url.as_str(), url),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn send(&self, request: &OutboundRequest) -> Result<BackendResponse> {
        let url = self.resolve(&request.url)?;
        tracing::debug!(method = %request.method, url = %url, "Dispatching to backend");

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .headers(request.headers.clone());
        if let Some(body) = request.body.to_bytes() {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        BackendResponse::from_reqwest(response).await
    }

    async fn refresh(&self, pair: &CredentialPair) -> Result<TokenPair> {
        let url = graft(self.base_url.as_str(), &self.refresh_path)?;
        tracing::debug!(url = %url, "Calling refresh endpoint");

        let response = self
            .client
            .post(url)
            .bearer_auth(pair.access.token())
            .json(&RefreshRequest {
                refresh_token: pair.refresh.token(),
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProxyError::RefreshTimeout(self.timeout)
                } else {
                    e.into()
                }
            })?;

        let response = BackendResponse::from_reqwest(response).await?;
        if !response.status.is_success() {
            return Err(ProxyError::RefreshRejected(response));
        }

        serde_json::from_slice(&response.body)
            .map_err(|e| ProxyError::InvalidRefreshResponse(format!("{}", e)))
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Resolve the `Authorization` header for `caller`.
///
/// A trusted forwarder's own header wins; everyone else gets the stored
/// access credential, or no header at all.
pub fn authorize(
    request: &mut OutboundRequest,
    caller: CallerContext,
    credentials: &Credentials,
) -> Result<()> {
    if caller == CallerContext::TrustedForwarder && request.headers.contains_key(AUTHORIZATION) {
        return Ok(());
    }

    request.headers.remove(AUTHORIZATION);
    if let Some(access) = &credentials.access {
        request.set_bearer(access.token())?;
    }
    Ok(())
}

/// Sends requests with credentials and recovers from expired tokens.
#[derive(Clone)]
pub struct Dispatcher {
    backend: SharedBackend,
    coordinator: RefreshCoordinator,
    cache: SharedResponseCache,
    expired_message: String,
}

impl Dispatcher {
    pub fn new(
        backend: SharedBackend,
        coordinator: RefreshCoordinator,
        cache: SharedResponseCache,
    ) -> Self {
        Self {
            backend,
            coordinator,
            cache,
            expired_message: DEFAULT_EXPIRED_MESSAGE.to_string(),
        }
    }

    pub fn with_expired_message(mut self, message: impl Into<String>) -> Self {
        self.expired_message = message.into();
        self
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Dispatch `request` on behalf of `caller`.
    pub async fn dispatch(
        &self,
        mut request: OutboundRequest,
        caller: CallerContext,
        store: &SharedCredentialStore,
    ) -> Result<BackendResponse> {
        let credentials = store.snapshot();
        let own_authorization = caller == CallerContext::TrustedForwarder
            && request.headers.contains_key(AUTHORIZATION);
        authorize(&mut request, caller, &credentials)?;

        let response = self.backend.send(&request).await?;

        match response.classify(&self.expired_message) {
            // The cookie pair has nothing to do with a forwarder's own token.
            ResponseClass::TokenExpired if own_authorization => {
                tracing::debug!(url = %request.url, "Forwarded token expired, surfacing as-is");
                Ok(response)
            }
            ResponseClass::TokenExpired => {
                let pair = credentials.pair().ok_or(ProxyError::MissingCredentials)?;
                tracing::debug!(url = %request.url, "Access token expired, deferring to refresh");

                let replayed = self
                    .coordinator
                    .register_failure(pair, request, store.clone())
                    .await?;
                if replayed.classify(&self.expired_message) == ResponseClass::Unauthorized {
                    self.invalidate_cache(replayed.status);
                }
                Ok(replayed)
            }
            ResponseClass::Unauthorized => {
                self.invalidate_cache(response.status);
                Ok(response)
            }
            ResponseClass::Success | ResponseClass::Failure => Ok(response),
        }
    }

    fn invalidate_cache(&self, status: StatusCode) {
        tracing::info!(status = %status, "Backend rejected credentials, invalidating response cache");
        self.cache.invalidate_all();
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backend", &self.backend)
            .field("expired_message", &self.expired_message)
            .finish_non_exhaustive()
    }
}
