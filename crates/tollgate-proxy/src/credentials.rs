//! Bearer credentials and their cookie-backed store.
//!
//! The browser holds two httpOnly cookies, one per credential. Each inbound
//! request gets its own [`CookieCredentialStore`] seeded from the `Cookie`
//! header; writes made while the request is being handled are turned into
//! `Set-Cookie` headers on the way out.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderValue};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;

/// Default cookie holding the access token.
pub const ACCESS_COOKIE: &str = "access_token";

/// Default cookie holding the refresh token.
pub const REFRESH_COOKIE: &str = "refresh_token";

/// Lifetime given to refresh tokens that carry no `exp` claim (7 days).
pub const DEFAULT_REFRESH_MAX_AGE_SECS: i64 = 7 * 24 * 60 * 60;

// ============================================================================
// Credential
// ============================================================================

/// Which of the two bearer credentials a token is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Access,
    Refresh,
}

/// Errors raised while decoding a token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// The token is not a three-part JWT with a JSON payload.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The payload decoded but has no usable `exp` claim.
    #[error("token has no expiry claim")]
    MissingExpiry,
}

/// A bearer token plus the expiry embedded in its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    kind: CredentialKind,
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Build an access credential. The token must decode and carry `exp`.
    pub fn access(token: impl Into<String>) -> Result<Self, CredentialError> {
        let token = token.into();
        let expires_at = decode_expiry(&token)?;
        Ok(Self {
            kind: CredentialKind::Access,
            token,
            expires_at: Some(expires_at),
        })
    }

    /// Build a refresh credential. Opaque refresh tokens are accepted; their
    /// expiry is unknown and cookies fall back to a fixed lifetime.
    pub fn refresh(token: impl Into<String>) -> Self {
        let token = token.into();
        let expires_at = decode_expiry(&token).ok();
        Self {
            kind: CredentialKind::Refresh,
            token,
            expires_at,
        }
    }

    pub fn kind(&self) -> CredentialKind {
        self.kind
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the embedded expiry lies at or before `now`.
    ///
    /// A credential with no known expiry is never reported as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }

    /// Seconds until expiry, clamped at zero; `fallback` when unknown.
    pub fn max_age_secs(&self, now: DateTime<Utc>, fallback: i64) -> i64 {
        match self.expires_at {
            Some(exp) => (exp - now).num_seconds().max(0),
            None => fallback,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    exp: Option<i64>,
}

/// Decode the `exp` claim from a JWT payload without verifying the signature.
///
/// Signature verification is the backend's job; the proxy only needs the
/// expiry to size cookies.
pub fn decode_expiry(token: &str) -> Result<DateTime<Utc>, CredentialError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) if !payload.is_empty() => payload,
        _ => return Err(CredentialError::Malformed("expected three segments".into())),
    };

    let trimmed = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .map_err(|e| CredentialError::Malformed(format!("payload is not base64: {}", e)))?;

    let claims: Claims = serde_json::from_slice(&bytes)
        .map_err(|e| CredentialError::Malformed(format!("payload is not JSON: {}", e)))?;

    let exp = claims.exp.ok_or(CredentialError::MissingExpiry)?;
    DateTime::from_timestamp(exp, 0).ok_or(CredentialError::MissingExpiry)
}

// ============================================================================
// Credential pair
// ============================================================================

/// The (access, refresh) tuple persisted together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPair {
    pub access: Credential,
    pub refresh: Credential,
}

impl CredentialPair {
    /// Validate and pair two raw tokens.
    pub fn from_tokens(access: &str, refresh: &str) -> Result<Self, CredentialError> {
        Ok(Self {
            access: Credential::access(access)?,
            refresh: Credential::refresh(refresh),
        })
    }
}

/// A point-in-time read of both credentials.
///
/// Either side may be absent independently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access: Option<Credential>,
    pub refresh: Option<Credential>,
}

impl Credentials {
    /// Both credentials, if both are present.
    pub fn pair(&self) -> Option<CredentialPair> {
        match (&self.access, &self.refresh) {
            (Some(access), Some(refresh)) => Some(CredentialPair {
                access: access.clone(),
                refresh: refresh.clone(),
            }),
            _ => None,
        }
    }
}

impl From<CredentialPair> for Credentials {
    fn from(pair: CredentialPair) -> Self {
        Self {
            access: Some(pair.access),
            refresh: Some(pair.refresh),
        }
    }
}

// ============================================================================
// CredentialStore trait
// ============================================================================

/// Storage for the current credential pair.
///
/// Implementations must make `replace` and `clear` whole-pair operations:
/// a concurrent `snapshot` sees either the old pair or the new one.
pub trait CredentialStore: Send + Sync + std::fmt::Debug {
    /// Read both credentials at once.
    fn snapshot(&self) -> Credentials;

    /// Replace both credentials.
    fn replace(&self, pair: CredentialPair);

    /// Remove both credentials.
    fn clear(&self);
}

/// Shared credential store for use across async contexts.
pub type SharedCredentialStore = Arc<dyn CredentialStore>;

// ============================================================================
// CookieCredentialStore
// ============================================================================

/// Cookie naming and attribute settings.
#[derive(Debug, Clone)]
pub struct CookieSettings {
    pub access_name: String,
    pub refresh_name: String,
    /// `Secure` attribute; off only for local development.
    pub secure: bool,
    /// `Max-Age` for refresh tokens without an `exp` claim.
    pub refresh_fallback_max_age: i64,
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            access_name: ACCESS_COOKIE.to_string(),
            refresh_name: REFRESH_COOKIE.to_string(),
            secure: true,
            refresh_fallback_max_age: DEFAULT_REFRESH_MAX_AGE_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingWrite {
    Replaced,
    Cleared,
}

#[derive(Debug, Default)]
struct CookieState {
    current: Credentials,
    pending: Option<PendingWrite>,
}

/// Request-scoped store reading from the inbound `Cookie` header.
#[derive(Debug)]
pub struct CookieCredentialStore {
    settings: CookieSettings,
    state: RwLock<CookieState>,
}

impl CookieCredentialStore {
    /// An empty store, as for a request that carried no cookies.
    pub fn new(settings: CookieSettings) -> Self {
        Self {
            settings,
            state: RwLock::new(CookieState::default()),
        }
    }

    /// Seed a store from the inbound request headers.
    ///
    /// An access cookie that does not decode is treated as absent.
    pub fn from_headers(headers: &HeaderMap, settings: CookieSettings) -> Self {
        let jar = CookieJar::from_headers(headers);

        let access = jar
            .get(&settings.access_name)
            .map(|c| c.value())
            .filter(|v| !v.is_empty())
            .and_then(|value| match Credential::access(value) {
                Ok(credential) => Some(credential),
                Err(e) => {
                    tracing::warn!(error = %e, "Ignoring undecodable access cookie");
                    None
                }
            });
        let refresh = jar
            .get(&settings.refresh_name)
            .map(|c| c.value())
            .filter(|v| !v.is_empty())
            .map(Credential::refresh);

        Self {
            settings,
            state: RwLock::new(CookieState {
                current: Credentials { access, refresh },
                pending: None,
            }),
        }
    }

    pub fn settings(&self) -> &CookieSettings {
        &self.settings
    }

    /// Whether a write happened since the store was created.
    pub fn is_dirty(&self) -> bool {
        self.state.read().pending.is_some()
    }

    /// `Set-Cookie` values for any write made during this request.
    pub fn set_cookie_headers(&self, now: DateTime<Utc>) -> Vec<HeaderValue> {
        let state = self.state.read();
        let cookies = match state.pending {
            None => return Vec::new(),
            Some(PendingWrite::Cleared) => vec![
                self.build_cookie(&self.settings.access_name, String::new(), 0),
                self.build_cookie(&self.settings.refresh_name, String::new(), 0),
            ],
            Some(PendingWrite::Replaced) => {
                let mut cookies = Vec::with_capacity(2);
                if let Some(access) = &state.current.access {
                    cookies.push(self.build_cookie(
                        &self.settings.access_name,
                        access.token().to_string(),
                        access.max_age_secs(now, 0),
                    ));
                }
                if let Some(refresh) = &state.current.refresh {
                    cookies.push(self.build_cookie(
                        &self.settings.refresh_name,
                        refresh.token().to_string(),
                        refresh.max_age_secs(now, self.settings.refresh_fallback_max_age),
                    ));
                }
                cookies
            }
        };

        cookies
            .into_iter()
            .filter_map(|cookie| match HeaderValue::from_str(&cookie.to_string()) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(
                        cookie = cookie.name(),
                        "Token is not a valid header value, cookie not updated"
                    );
                    None
                }
            })
            .collect()
    }

    fn build_cookie(&self, name: &str, value: String, max_age: i64) -> Cookie<'static> {
        Cookie::build((name.to_string(), value))
            .http_only(true)
            .path("/")
            .secure(self.settings.secure)
            .same_site(SameSite::Lax)
            .max_age(time::Duration::seconds(max_age))
            .build()
    }
}

impl CredentialStore for CookieCredentialStore {
    fn snapshot(&self) -> Credentials {
        self.state.read().current.clone()
    }

    fn replace(&self, pair: CredentialPair) {
        let mut state = self.state.write();
        state.current = pair.into();
        state.pending = Some(PendingWrite::Replaced);
    }

    fn clear(&self) {
        let mut state = self.state.write();
        state.current = Credentials::default();
        state.pending = Some(PendingWrite::Cleared);
    }
}

// ============================================================================
// TokenInfo
// ============================================================================

/// Expiry information about a token, for display.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub expires_at: Option<DateTime<Utc>>,
    pub expires_in_secs: u64,
    pub is_expired: bool,
}

impl TokenInfo {
    pub fn from_credential(credential: &Credential, now: DateTime<Utc>) -> Self {
        Self {
            expires_at: credential.expires_at(),
            expires_in_secs: credential.max_age_secs(now, 0).max(0) as u64,
            is_expired: credential.is_expired_at(now),
        }
    }

    pub fn expires_in_display(&self) -> String {
        if self.expires_at.is_none() {
            "Unknown (no expiry claim)".to_string()
        } else if self.is_expired {
            "Expired".to_string()
        } else {
            let hours = self.expires_in_secs / 3600;
            let minutes = (self.expires_in_secs % 3600) / 60;
            format!("{}h {}m", hours, minutes)
        }
    }
}
