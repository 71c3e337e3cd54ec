//! Proxy authentication gate
//!
//! Both schemes read the `Proxy-Authorization` header and hand the decoded
//! credential to a caller-supplied predicate. The header is removed from the
//! request on every path, so a request object can be validated only once.

use crate::protocol::authority::Credentials;
use crate::protocol::header::{PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE};
use crate::protocol::message::{HttpRequest, HttpResponse};
use crate::protocol::status::HttpStatus;
use crate::util::{ProxyError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::sync::Arc;

/// Realm advertised in authentication challenges
pub const REALM: &str = "relay-proxy";

pub type BasicPredicate = dyn Fn(&Credentials) -> Result<bool> + Send + Sync;
pub type BearerPredicate = dyn Fn(&str) -> Result<bool> + Send + Sync;

/// Authentication scheme with the predicate deciding who gets through
#[derive(Clone)]
pub enum Authenticator {
    Basic(Arc<BasicPredicate>),
    Bearer(Arc<BearerPredicate>),
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Authenticator({})", self.scheme_name())
    }
}

impl Authenticator {
    pub fn basic<F>(predicate: F) -> Self
    where
        F: Fn(&Credentials) -> bool + Send + Sync + 'static,
    {
        Self::Basic(Arc::new(move |credentials| Ok(predicate(credentials))))
    }

    /// Basic scheme with a predicate that may fail (e.g. a credential store lookup)
    pub fn try_basic<F>(predicate: F) -> Self
    where
        F: Fn(&Credentials) -> Result<bool> + Send + Sync + 'static,
    {
        Self::Basic(Arc::new(predicate))
    }

    pub fn bearer<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self::Bearer(Arc::new(move |token| Ok(predicate(token))))
    }

    pub fn try_bearer<F>(predicate: F) -> Self
    where
        F: Fn(&str) -> Result<bool> + Send + Sync + 'static,
    {
        Self::Bearer(Arc::new(predicate))
    }

    /// Accept exactly one username/password pair
    pub fn basic_static(username: impl Into<String>, password: impl Into<String>) -> Self {
        let expected = Credentials::new(username, password);
        Self::basic(move |credentials| *credentials == expected)
    }

    /// Accept exactly one bearer token
    pub fn bearer_static(token: impl Into<String>) -> Self {
        let expected = token.into();
        Self::bearer(move |token| token == expected)
    }

    pub fn scheme_name(&self) -> &'static str {
        match self {
            Authenticator::Basic(_) => "Basic",
            Authenticator::Bearer(_) => "Bearer",
        }
    }

    /// Check the request's proxy credentials.
    ///
    /// Returns `None` when the request is accepted, otherwise the response
    /// to send back instead of forwarding.
    pub fn validate(&self, request: &mut HttpRequest) -> Option<HttpResponse> {
        let mut presented = request.headers_mut().remove(PROXY_AUTHORIZATION);
        let header = match presented.len() {
            0 => {
                tracing::debug!("[Auth] No {} header", PROXY_AUTHORIZATION);
                return Some(self.challenge(
                    HttpStatus::PROXY_AUTHENTICATION_REQUIRED,
                    PROXY_AUTHENTICATE,
                    "Proxy authentication required",
                ));
            }
            1 => presented.remove(0),
            n => {
                tracing::debug!("[Auth] {} {} headers", n, PROXY_AUTHORIZATION);
                return Some(self.unauthorized());
            }
        };

        let verdict = match self {
            Authenticator::Basic(predicate) => {
                decode_basic(header.value()).map(|credentials| predicate(&credentials))
            }
            Authenticator::Bearer(predicate) => {
                decode_token(header.value(), "Bearer").map(|token| predicate(token))
            }
        };

        match verdict {
            Err(e) => {
                tracing::debug!("[Auth] Malformed credentials: {}", e);
                Some(self.unauthorized())
            }
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => {
                tracing::debug!("[Auth] {} credentials rejected", self.scheme_name());
                Some(self.unauthorized())
            }
            Ok(Err(e)) => {
                tracing::warn!("[Auth] Credential check failed: {}", e);
                Some(HttpResponse::error(
                    HttpStatus::BAD_REQUEST,
                    "Unable to verify credentials",
                ))
            }
        }
    }

    fn unauthorized(&self) -> HttpResponse {
        self.challenge(HttpStatus::UNAUTHORIZED, WWW_AUTHENTICATE, "Unauthorized")
    }

    fn challenge(&self, status: HttpStatus, header: &'static str, message: &str) -> HttpResponse {
        let mut response = HttpResponse::error(status, message);
        response
            .headers_mut()
            .append(header, format!("{} realm=\"{}\"", self.scheme_name(), REALM));
        response
    }
}

fn decode_token<'a>(value: &'a str, scheme: &str) -> Result<&'a str> {
    let (name, token) = value
        .trim()
        .split_once(' ')
        .ok_or_else(|| ProxyError::Auth("missing credentials after scheme".into()))?;
    if !name.eq_ignore_ascii_case(scheme) {
        return Err(ProxyError::Auth(format!("expected {} scheme, got '{}'", scheme, name)));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(ProxyError::Auth("empty credentials".into()));
    }
    Ok(token)
}

fn decode_basic(value: &str) -> Result<Credentials> {
    let encoded = decode_token(value, "Basic")?;
    let decoded = STANDARD
        .decode(encoded)
        .map_err(|e| ProxyError::Auth(format!("invalid base64: {}", e)))?;
    let text = String::from_utf8(decoded)
        .map_err(|_| ProxyError::Auth("credentials are not valid UTF-8".into()))?;
    Credentials::parse(&text).map_err(|e| ProxyError::Auth(e.to_string()))
}
