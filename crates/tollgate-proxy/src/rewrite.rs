//! Outbound target resolution.
//!
//! A [`RewriteRule`] looks at the inbound request and names where it should
//! go, either as a bare string or as a structured rule with an optional
//! target origin. [`resolve`] turns that into a concrete URL:
//!
//! 1. An absolute rule URL without `change_origin` (or without a target) is
//!    used verbatim.
//! 2. An absolute rule URL with `change_origin` and a target keeps its own
//!    path and query but takes the target's scheme, host, port and base path.
//! 3. A bare path with a target is appended to the target.
//! 4. A bare path without a target is appended to an origin discovered from
//!    the inbound `referer`, `x-forwarded-host`/`x-forwarded-proto` or `host`
//!    headers. With no origin at all the path stays relative.

use std::fmt;
use std::sync::Arc;

use axum::http::header::{HOST, REFERER};
use axum::http::{HeaderMap, Method, Uri};
use url::Url;

use crate::error::{ProxyError, Result};

/// What a rewrite rule produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteTarget {
    /// A bare path or absolute URL.
    Url(String),
    /// A path or absolute URL plus an optional target origin.
    Rule {
        path: String,
        target: Option<String>,
        change_origin: bool,
    },
}

/// The parts of the inbound request a rule may inspect.
#[derive(Debug, Clone, Copy)]
pub struct InboundView<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    /// Path and query with the routing prefix removed.
    pub forward_path: &'a str,
}

/// Computes the outbound target for an inbound request.
pub trait RewriteRule: Send + Sync {
    fn rewrite(&self, inbound: &InboundView<'_>) -> RewriteTarget;
}

impl<F> RewriteRule for F
where
    F: Fn(&InboundView<'_>) -> RewriteTarget + Send + Sync,
{
    fn rewrite(&self, inbound: &InboundView<'_>) -> RewriteTarget {
        self(inbound)
    }
}

/// Shared rewrite rule.
pub type SharedRewriteRule = Arc<dyn RewriteRule>;

/// Forwards every request's path to one fixed target.
#[derive(Debug, Clone, Default)]
pub struct StaticTarget {
    target: Option<String>,
    change_origin: bool,
}

impl StaticTarget {
    pub fn new(target: Option<String>) -> Self {
        Self {
            target,
            change_origin: false,
        }
    }

    pub fn with_change_origin(mut self, change_origin: bool) -> Self {
        self.change_origin = change_origin;
        self
    }
}

impl RewriteRule for StaticTarget {
    fn rewrite(&self, inbound: &InboundView<'_>) -> RewriteTarget {
        RewriteTarget::Rule {
            path: inbound.forward_path.to_string(),
            target: self.target.clone(),
            change_origin: self.change_origin,
        }
    }
}

/// A resolved outbound target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    Absolute(Url),
    /// No origin could be determined; resolved later against the backend
    /// base URL.
    Relative(String),
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedTarget::Absolute(url) => write!(f, "{}", url),
            ResolvedTarget::Relative(path) => write!(f, "{}", path),
        }
    }
}

/// Resolve a rule's output against the inbound request headers.
pub fn resolve(output: RewriteTarget, inbound_headers: &HeaderMap) -> Result<ResolvedTarget> {
    let (path, target, change_origin) = match output {
        RewriteTarget::Url(path) => (path, None, false),
        RewriteTarget::Rule {
            path,
            target,
            change_origin,
        } => (path, target.filter(|t| !t.is_empty()), change_origin),
    };

    if let Some(absolute) = parse_absolute(&path) {
        return match (change_origin, target) {
            (true, Some(target)) => {
                let path_and_query = match absolute.query() {
                    Some(query) => format!("{}?{}", absolute.path(), query),
                    None => absolute.path().to_string(),
                };
                graft(&target, &path_and_query).map(ResolvedTarget::Absolute)
            }
            _ => Ok(ResolvedTarget::Absolute(absolute)),
        };
    }

    if let Some(target) = target {
        return graft(&target, &path).map(ResolvedTarget::Absolute);
    }

    match discover_origin(inbound_headers) {
        Some(origin) => graft(&origin, &path).map(ResolvedTarget::Absolute),
        None => Ok(ResolvedTarget::Relative(path)),
    }
}

fn parse_absolute(candidate: &str) -> Option<Url> {
    Url::parse(candidate)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
}

/// Append `path_and_query` to `target`, keeping the target's base path.
pub(crate) fn graft(target: &str, path_and_query: &str) -> Result<Url> {
    let mut url = Url::parse(target)?;
    if url.cannot_be_a_base() || !url.has_host() {
        return Err(ProxyError::InvalidTarget(target.to_string()));
    }

    let (path, query) = match path_and_query.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (path_and_query, None),
    };

    let base = url.path().trim_end_matches('/').to_string();
    let joined = if path.starts_with('/') {
        format!("{}{}", base, path)
    } else {
        format!("{}/{}", base, path)
    };

    url.set_path(&joined);
    url.set_query(query);
    url.set_fragment(None);
    Ok(url)
}

/// Origin of the inbound request as seen by the client.
pub fn discover_origin(headers: &HeaderMap) -> Option<String> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(referer) = headers.get(REFERER).and_then(|v| v.to_str().ok())
        && let Some(url) = parse_absolute(referer)
    {
        return Some(url.origin().ascii_serialization());
    }

    let proto = header("x-forwarded-proto")
        .and_then(|p| p.split(',').next())
        .map(str::trim)
        .unwrap_or("http");

    if let Some(host) = header("x-forwarded-host").and_then(|h| h.split(',').next()) {
        return Some(format!("{}://{}", proto, host.trim()));
    }

    header(HOST.as_str()).map(|host| format!("{}://{}", proto, host))
}
