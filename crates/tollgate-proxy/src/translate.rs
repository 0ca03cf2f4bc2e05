//! Inbound request to outbound request descriptor.

use axum::body::Body;
use axum::http::header::{
    AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, REFERER,
    TRANSFER_ENCODING,
};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use url::form_urlencoded;

use crate::error::{ProxyError, Result};

/// Default routing prefix.
pub const DEFAULT_PREFIX: &str = "/api";

/// Largest inbound body the translator will buffer (10 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 10 * 1024 * 1024;

/// Inbound headers never forwarded to the backend.
pub const STRIPPED_REQUEST_HEADERS: [HeaderName; 6] = [
    COOKIE,
    REFERER,
    HOST,
    CONTENT_LENGTH,
    TRANSFER_ENCODING,
    CONNECTION,
];

/// Who is on the other end of the inbound connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallerContext {
    /// An end-user browser; inbound `Authorization` is never trusted.
    #[default]
    Browser,
    /// An internal service whose peer address is listed in configuration.
    TrustedForwarder,
}

/// Outbound request body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// No body, as for GET/DELETE/HEAD/OPTIONS.
    Absent,
    Json(serde_json::Value),
    /// Ordered form pairs, duplicates kept.
    Form(Vec<(String, String)>),
    /// Multipart payload with its boundary framing intact.
    Multipart(Bytes),
    Raw(Bytes),
}

impl RequestBody {
    pub fn is_absent(&self) -> bool {
        matches!(self, RequestBody::Absent)
    }

    /// Encode for the wire. `None` means send no body at all.
    pub fn to_bytes(&self) -> Option<Bytes> {
        match self {
            RequestBody::Absent => None,
            RequestBody::Json(value) => serde_json::to_vec(value).ok().map(Bytes::from),
            RequestBody::Form(pairs) => {
                let encoded = form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish();
                Some(Bytes::from(encoded))
            }
            RequestBody::Multipart(bytes) | RequestBody::Raw(bytes) => Some(bytes.clone()),
        }
    }
}

/// Everything needed to issue one backend call.
///
/// `url` starts out as the forwarded path and is replaced by the rewrite
/// resolver; it may stay relative, in which case the backend resolves it
/// against its base URL.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl OutboundRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: RequestBody::Absent,
        }
    }

    /// Set `Authorization: Bearer <token>`, replacing any existing value.
    pub fn set_bearer(&mut self, token: &str) -> Result<()> {
        let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            ProxyError::MalformedInput("access token is not a valid header value".to_string())
        })?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    /// A copy of this request carrying a new access token, for replay.
    pub fn with_bearer(&self, token: &str) -> Result<Self> {
        let mut replay = self.clone();
        replay.set_bearer(token)?;
        Ok(replay)
    }

    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// Strip `prefix` from `path` when it is a whole leading segment.
///
/// `/api/x` becomes `/x`, `/api` becomes `/`, and `/apiary` is untouched.
pub fn strip_prefix<'a>(path: &'a str, prefix: &str) -> &'a str {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return path;
    }
    match path.strip_prefix(prefix) {
        Some("") => "/",
        Some(rest) if rest.starts_with('/') => rest,
        _ => path,
    }
}

/// Whether `path` lies under `prefix` as a whole segment.
pub fn has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty() || strip_prefix(path, prefix).len() != path.len()
}

/// Forwarded path plus query for an inbound URI.
pub fn forward_path(parts: &Parts, prefix: &str) -> String {
    let path = strip_prefix(parts.uri.path(), prefix);
    match parts.uri.query() {
        Some(query) => format!("{}?{}", path, query),
        None => path.to_string(),
    }
}

/// Translate an inbound request into an outbound descriptor.
pub async fn translate_request(
    parts: &Parts,
    body: Body,
    prefix: &str,
    max_body_size: usize,
) -> Result<OutboundRequest> {
    let mut headers = parts.headers.clone();
    for name in STRIPPED_REQUEST_HEADERS.iter() {
        headers.remove(name);
    }

    let body = if carries_body(&parts.method) {
        let bytes = read_body(body, max_body_size).await?;
        decode_body(&parts.headers, bytes)?
    } else {
        RequestBody::Absent
    };

    Ok(OutboundRequest {
        method: parts.method.clone(),
        url: forward_path(parts, prefix),
        headers,
        body,
    })
}

/// Buffer `body`, refusing anything past `limit` bytes.
async fn read_body(body: Body, limit: usize) -> Result<Bytes> {
    let mut stream = body.into_data_stream();
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| ProxyError::MalformedInput(format!("Failed to read body: {}", e)))?;
        if buf.len() + chunk.len() > limit {
            return Err(ProxyError::PayloadTooLarge(limit));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn carries_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}

/// Lower-cased media type without parameters.
fn media_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| v.trim().to_ascii_lowercase())
}

fn boundary(headers: &HeaderMap) -> Option<String> {
    let content_type = headers.get(CONTENT_TYPE)?.to_str().ok()?;
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if key.trim().eq_ignore_ascii_case("boundary") {
            let value = value.trim().trim_matches('"');
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}

fn decode_body(headers: &HeaderMap, bytes: Bytes) -> Result<RequestBody> {
    if bytes.is_empty() {
        return Ok(RequestBody::Absent);
    }

    let media_type = media_type(headers).unwrap_or_default();

    if media_type == "application/json" || media_type.ends_with("+json") {
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| ProxyError::MalformedInput(format!("Invalid JSON: {}", e)))?;
        Ok(RequestBody::Json(value))
    } else if media_type == "application/x-www-form-urlencoded" {
        std::str::from_utf8(&bytes)
            .map_err(|_| ProxyError::MalformedInput("Form body is not UTF-8".to_string()))?;
        let pairs = form_urlencoded::parse(&bytes).into_owned().collect();
        Ok(RequestBody::Form(pairs))
    } else if media_type == "multipart/form-data" {
        let boundary = boundary(headers).ok_or_else(|| {
            ProxyError::MalformedInput("multipart body without boundary".to_string())
        })?;
        let delimiter = format!("--{}", boundary);
        if !contains(&bytes, delimiter.as_bytes()) {
            return Err(ProxyError::MalformedInput(
                "multipart body does not contain its boundary".to_string(),
            ));
        }
        Ok(RequestBody::Multipart(bytes))
    } else {
        Ok(RequestBody::Raw(bytes))
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
