//! HTTP status codes, reason phrases and the headers each status mandates.

use crate::protocol::header::{ALLOW, PROXY_AUTHENTICATE, UPGRADE, WWW_AUTHENTICATE};
use crate::util::{ProxyError, Result};
use std::borrow::Cow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpStatus {
    code: u16,
    reason: Cow<'static, str>,
    required_headers: &'static [&'static str],
}

macro_rules! statuses {
    ($($name:ident = $code:literal, $reason:literal, [$($required:expr),*];)*) => {
        impl HttpStatus {
            $(
                pub const $name: HttpStatus = HttpStatus {
                    code: $code,
                    reason: Cow::Borrowed($reason),
                    required_headers: &[$($required),*],
                };
            )*

            fn known(code: u16) -> Option<HttpStatus> {
                match code {
                    $($code => Some(HttpStatus::$name),)*
                    _ => None,
                }
            }
        }
    };
}

statuses! {
    CONTINUE = 100, "Continue", [];
    SWITCHING_PROTOCOLS = 101, "Switching Protocols", [UPGRADE];
    OK = 200, "OK", [];
    CREATED = 201, "Created", [];
    ACCEPTED = 202, "Accepted", [];
    NO_CONTENT = 204, "No Content", [];
    PARTIAL_CONTENT = 206, "Partial Content", [];
    MOVED_PERMANENTLY = 301, "Moved Permanently", [];
    FOUND = 302, "Found", [];
    SEE_OTHER = 303, "See Other", [];
    NOT_MODIFIED = 304, "Not Modified", [];
    TEMPORARY_REDIRECT = 307, "Temporary Redirect", [];
    PERMANENT_REDIRECT = 308, "Permanent Redirect", [];
    BAD_REQUEST = 400, "Bad Request", [];
    UNAUTHORIZED = 401, "Unauthorized", [WWW_AUTHENTICATE];
    FORBIDDEN = 403, "Forbidden", [];
    NOT_FOUND = 404, "Not Found", [];
    METHOD_NOT_ALLOWED = 405, "Method Not Allowed", [ALLOW];
    PROXY_AUTHENTICATION_REQUIRED = 407, "Proxy Authentication Required", [PROXY_AUTHENTICATE];
    REQUEST_TIMEOUT = 408, "Request Timeout", [];
    PAYLOAD_TOO_LARGE = 413, "Payload Too Large", [];
    UPGRADE_REQUIRED = 426, "Upgrade Required", [UPGRADE];
    TOO_MANY_REQUESTS = 429, "Too Many Requests", [];
    INTERNAL_SERVER_ERROR = 500, "Internal Server Error", [];
    NOT_IMPLEMENTED = 501, "Not Implemented", [];
    BAD_GATEWAY = 502, "Bad Gateway", [];
    SERVICE_UNAVAILABLE = 503, "Service Unavailable", [];
    GATEWAY_TIMEOUT = 504, "Gateway Timeout", [];
}

impl HttpStatus {
    /// Status for `code` with its standard reason phrase
    pub fn from_code(code: u16) -> Result<Self> {
        match Self::known(code) {
            Some(status) => Ok(status),
            None => Self::with_reason(code, ""),
        }
    }

    /// Status for `code` carrying a custom reason phrase
    pub fn with_reason(code: u16, reason: impl Into<String>) -> Result<Self> {
        if !(100..600).contains(&code) {
            return Err(ProxyError::Parse(format!("status code {} is out of range", code)));
        }
        let required_headers = Self::known(code).map(|s| s.required_headers).unwrap_or(&[]);
        Ok(Self {
            code,
            reason: Cow::Owned(reason.into()),
            required_headers,
        })
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Headers a response with this status must carry to be serialized
    pub fn required_headers(&self) -> &'static [&'static str] {
        self.required_headers
    }

    pub fn category(&self) -> StatusCategory {
        match self.code / 100 {
            1 => StatusCategory::Informational,
            2 => StatusCategory::Success,
            3 => StatusCategory::Redirection,
            4 => StatusCategory::ClientError,
            _ => StatusCategory::ServerError,
        }
    }

    /// Responses with this status never carry a body
    pub fn is_bodyless(&self) -> bool {
        self.category() == StatusCategory::Informational || self.code == 204 || self.code == 304
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}
