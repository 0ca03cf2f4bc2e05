//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use reqwest::Client;
use tokio::sync::oneshot;
use wiremock::MockServer;

use tollgate_proxy::{CookieSettings, ProxyConfig, ProxyServer, ResponseCache};

/// Build an unsigned JWT expiring `ttl_secs` from now.
pub fn make_jwt(subject: &str, ttl_secs: i64) -> String {
    let exp = chrono::Utc::now().timestamp() + ttl_secs;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"{}","exp":{}}}"#, subject, exp));
    format!("{}.{}.signature", header, payload)
}

/// `Cookie` header value carrying both credentials.
pub fn cookie_header(access: &str, refresh: &str) -> String {
    format!("access_token={}; refresh_token={}", access, refresh)
}

/// Cache that counts invalidations.
#[derive(Debug, Default)]
pub struct CountingCache {
    pub invalidations: AtomicUsize,
}

impl CountingCache {
    pub fn count(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }
}

impl ResponseCache for CountingCache {
    fn invalidate_all(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// A proxy running in the background in front of a wiremock backend.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub client: Client,
    pub backend: MockServer,
    _shutdown: oneshot::Sender<()>,
}

impl TestProxy {
    /// Start with default configuration.
    pub async fn start() -> Result<Self> {
        Self::start_with(|config| config, |server| server).await
    }

    /// Start with a customized config and server.
    pub async fn start_with(
        configure: impl FnOnce(ProxyConfig) -> ProxyConfig,
        customize: impl FnOnce(ProxyServer) -> ProxyServer,
    ) -> Result<Self> {
        let backend = MockServer::start().await;
        Self::start_against(backend, configure, customize).await
    }

    /// Start against an existing backend.
    pub async fn start_against(
        backend: MockServer,
        configure: impl FnOnce(ProxyConfig) -> ProxyConfig,
        customize: impl FnOnce(ProxyServer) -> ProxyServer,
    ) -> Result<Self> {
        let config = ProxyConfig::new(backend.uri())
            .with_request_logging(false)
            .with_cookies(CookieSettings {
                secure: false,
                ..Default::default()
            });
        let server = customize(ProxyServer::new(configure(config))?);

        let (shutdown, signal) = oneshot::channel::<()>();
        let addr = server
            .run_with_shutdown(async move {
                let _ = signal.await;
            })
            .await?;

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            addr,
            client,
            backend,
            _shutdown: shutdown,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(format!("{}{}", self.base_url(), path))
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(format!("{}{}", self.base_url(), path))
    }

    /// GET with both credential cookies attached.
    pub fn get_with_cookies(&self, path: &str, access: &str, refresh: &str) -> reqwest::RequestBuilder {
        self.get(path)
            .header(reqwest::header::COOKIE, cookie_header(access, refresh))
    }
}

/// Every `Set-Cookie` value on a response.
pub fn set_cookies(response: &reqwest::Response) -> Vec<String> {
    response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(String::from))
        .collect()
}

/// Shared counting cache, as installed on the server and held by the test.
pub fn counting_cache() -> Arc<CountingCache> {
    Arc::new(CountingCache::default())
}
