//! Structured HTTP requests and responses.

use crate::protocol::authority::UriAuthority;
use crate::protocol::content_type::DEFAULT_CHARSET;
use crate::protocol::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, DATE, Headers, HOST, PROXY_CONNECTION,
};
use crate::protocol::status::HttpStatus;
use crate::util::{ProxyError, Result};
use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

pub const HTTP_1_1: &str = "HTTP/1.1";
pub const HTTP_1_0: &str = "HTTP/1.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Connect => "CONNECT",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }
}

impl FromStr for Method {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        const ALL: [Method; 9] = [
            Method::Get,
            Method::Head,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Connect,
            Method::Options,
            Method::Trace,
            Method::Patch,
        ];
        ALL.into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProxyError::Parse(format!("unknown method '{}'", s)))
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keep-alive semantics of a message's `Connection` header for `version`
fn wants_keep_alive(version: &str, headers: &Headers, header: &str) -> bool {
    if headers.has_token(header, "close") {
        return false;
    }
    if version.eq_ignore_ascii_case(HTTP_1_0) {
        return headers.has_token(header, "keep-alive");
    }
    true
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    version: String,
    method: Method,
    authority: Option<UriAuthority>,
    path: String,
    charset: String,
    headers: Headers,
    body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            version: HTTP_1_1.to_string(),
            method,
            authority: None,
            path: path.into(),
            charset: DEFAULT_CHARSET.to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    /// Assemble a parsed request
    pub fn from_parts(
        version: impl Into<String>,
        method: Method,
        authority: Option<UriAuthority>,
        path: impl Into<String>,
        charset: impl Into<String>,
        headers: Headers,
        body: Option<Bytes>,
    ) -> Self {
        Self {
            version: version.into(),
            method,
            authority,
            path: path.into(),
            charset: charset.into(),
            headers,
            body,
        }
    }

    pub fn with_authority(mut self, authority: UriAuthority) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Result<Self> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// A copy of this request with no authority, so it serializes in
    /// origin form. Headers are copied, never shared.
    pub fn without_authority(&self) -> Self {
        Self {
            authority: None,
            ..self.clone()
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn authority(&self) -> Option<&UriAuthority> {
        self.authority.as_ref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn host(&self) -> Option<&str> {
        self.headers.first_value(HOST)
    }

    /// Whether the client expects the connection to stay open, judged by
    /// `Proxy-Connection` first and `Connection` otherwise.
    pub fn keep_alive(&self) -> bool {
        let header = if self.headers.contains(PROXY_CONNECTION) {
            PROXY_CONNECTION
        } else {
            CONNECTION
        };
        wants_keep_alive(&self.version, &self.headers, header)
    }

    /// Whether the destination connection should stay open
    pub fn connection_keep_alive(&self) -> bool {
        wants_keep_alive(&self.version, &self.headers, CONNECTION)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    version: String,
    status: HttpStatus,
    charset: String,
    headers: Headers,
    body: Option<Bytes>,
}

impl HttpResponse {
    pub fn new(status: HttpStatus) -> Self {
        Self {
            version: HTTP_1_1.to_string(),
            status,
            charset: DEFAULT_CHARSET.to_string(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn from_parts(
        version: impl Into<String>,
        status: HttpStatus,
        charset: impl Into<String>,
        headers: Headers,
        body: Option<Bytes>,
    ) -> Self {
        Self {
            version: version.into(),
            status,
            charset: charset.into(),
            headers,
            body,
        }
    }

    /// A proxy-generated response with a short plain-text body
    pub fn error(status: HttpStatus, message: &str) -> Self {
        let body = Bytes::from(format!("{}\n", message));
        let mut headers = Headers::new();
        let date = chrono::Utc::now()
            .format("%a, %d %b %Y %H:%M:%S GMT")
            .to_string();
        headers.append(DATE, date);
        headers.append(CONTENT_TYPE, "text/plain; charset=UTF-8");
        headers.append(CONTENT_LENGTH, body.len().to_string());
        Self {
            version: HTTP_1_1.to_string(),
            status,
            charset: DEFAULT_CHARSET.to_string(),
            headers,
            body: Some(body),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Result<Self> {
        self.headers.insert(name, value)?;
        Ok(self)
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn status(&self) -> &HttpStatus {
        &self.status
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    pub fn keep_alive(&self) -> bool {
        wants_keep_alive(&self.version, &self.headers, CONNECTION)
    }
}
