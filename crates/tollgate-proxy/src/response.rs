//! Backend response to inbound response.

use axum::body::Body;
use axum::http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HeaderName, SET_COOKIE, TRANSFER_ENCODING,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use hyper::ext::ReasonPhrase;

use crate::dispatch::BackendResponse;

/// Backend headers never passed back to the browser.
pub const STRIPPED_RESPONSE_HEADERS: [HeaderName; 5] =
    [SET_COOKIE, COOKIE, CONTENT_LENGTH, TRANSFER_ENCODING, CONNECTION];

/// Rebuild a backend response for the inbound caller.
pub fn into_response(backend: BackendResponse) -> Response {
    let BackendResponse {
        status,
        reason,
        mut headers,
        body,
    } = backend;

    for name in STRIPPED_RESPONSE_HEADERS.iter() {
        headers.remove(name);
    }

    let body = if is_json(&headers) {
        reencode_json(body)
    } else {
        body
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    if let Some(phrase) = reason.and_then(|r| reason_phrase(&r)) {
        response.extensions_mut().insert(phrase);
    }
    response
}

/// A `500` standing in for a backend call that produced no response.
///
/// The failure message becomes the status text.
pub fn network_failure(message: &str) -> Response {
    tracing::error!(error = %message, "Backend request failed");

    let body = serde_json::json!({
        "type": "error",
        "error": {
            "type": "network_error",
            "message": message
        }
    });

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        CONTENT_TYPE,
        axum::http::HeaderValue::from_static("application/json"),
    );
    if let Some(phrase) = reason_phrase(message) {
        response.extensions_mut().insert(phrase);
    }
    response
}

/// Status text as sent on the wire, when it differs from the canonical one.
pub fn status_text(response: &Response) -> Option<&[u8]> {
    response
        .extensions()
        .get::<ReasonPhrase>()
        .map(ReasonPhrase::as_bytes)
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "application/json" || v.ends_with("+json")
        })
        .unwrap_or(false)
}

/// Undecodable JSON passes through untouched.
fn reencode_json(body: Bytes) -> Bytes {
    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(value) => serde_json::to_vec(&value).map(Bytes::from).unwrap_or(body),
        Err(_) => body,
    }
}

/// Status text limited to characters a status line can carry.
fn reason_phrase(text: &str) -> Option<ReasonPhrase> {
    let cleaned: String = text
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { ' ' })
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return None;
    }
    ReasonPhrase::try_from(cleaned.as_bytes()).ok()
}
