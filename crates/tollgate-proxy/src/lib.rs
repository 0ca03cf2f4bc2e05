//! Cookie-authenticated reverse proxy with coalesced token refresh.
//!
//! Browser requests under a routing prefix are forwarded to a backend API
//! with the caller's access token attached as a bearer credential. When the
//! backend reports the token expired, one refresh call is made per refresh
//! token no matter how many requests failed at once, and every failed request
//! is replayed with the new credentials.
//!
//! # Example
//!
//! ```rust,ignore
//! use tollgate_proxy::{ProxyConfig, ProxyServer};
//!
//! let config = ProxyConfig::new("https://backend.example")
//!     .with_bind_addr("127.0.0.1:3000".parse()?);
//! ProxyServer::new(config)?.run().await?;
//! ```

pub mod cache;
pub mod credentials;
pub mod dispatch;
pub mod error;
pub mod refresh;
pub mod response;
pub mod rewrite;
pub mod server;
pub mod translate;

pub use cache::{NoopCache, ResponseCache, SharedResponseCache};
pub use credentials::{
    CookieCredentialStore, CookieSettings, Credential, CredentialError, CredentialKind,
    CredentialPair, CredentialStore, Credentials, SharedCredentialStore, TokenInfo,
    decode_expiry,
};
pub use dispatch::{
    Backend, BackendResponse, Dispatcher, HttpBackend, ResponseClass, SharedBackend, TokenPair,
    classify,
};
pub use error::{ProxyError, Result};
pub use refresh::RefreshCoordinator;
pub use rewrite::{
    InboundView, ResolvedTarget, RewriteRule, RewriteTarget, SharedRewriteRule, StaticTarget,
};
pub use server::{ProxyConfig, ProxyServer};
pub use translate::{CallerContext, OutboundRequest, RequestBody};
