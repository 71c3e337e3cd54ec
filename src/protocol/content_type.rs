//! `Content-Type` values: mime type, charset and ordered parameters.

use crate::util::{ProxyError, Result};
use std::fmt;

/// Charset assumed for message bodies that do not declare one
pub const DEFAULT_CHARSET: &str = "UTF-8";

/// Charset implied by a mime type when none is given
pub fn default_charset(mime: &str) -> Option<&'static str> {
    match mime {
        "application/json"
        | "application/ld+json"
        | "application/problem+json"
        | "application/javascript"
        | "application/xml"
        | "application/x-www-form-urlencoded"
        | "text/javascript" => Some("UTF-8"),
        "text/plain" | "text/csv" => Some("US-ASCII"),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    mime: String,
    charset: Option<String>,
    parameters: Vec<(String, String)>,
}

impl ContentType {
    /// Build a content type; `multipart/*` requires at least one parameter.
    pub fn new(
        mime: &str,
        charset: Option<&str>,
        parameters: Vec<(String, String)>,
    ) -> Result<Self> {
        let mime = mime.trim().to_ascii_lowercase();
        let valid_mime = mime
            .split_once('/')
            .is_some_and(|(t, s)| is_token(t) && is_token(s));
        if !valid_mime {
            return Err(ProxyError::ContentType(format!("invalid mime type '{}'", mime)));
        }
        if mime.starts_with("multipart/") && parameters.is_empty() {
            return Err(ProxyError::ContentType(format!(
                "{} requires a boundary parameter",
                mime
            )));
        }
        for (name, _) in &parameters {
            if !is_token(name) {
                return Err(ProxyError::ContentType(format!(
                    "invalid parameter name '{}'",
                    name
                )));
            }
        }
        let charset = charset
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .or_else(|| default_charset(&mime).map(str::to_string));
        Ok(Self {
            mime,
            charset,
            parameters,
        })
    }

    /// Parse a header value such as `text/html; charset=utf-8; q=1`
    pub fn parse(value: &str) -> Result<Self> {
        let parts = split_unquoted(value, ';');
        let mut parts = parts.into_iter();
        let mime = parts.next().unwrap_or_default();
        let mut charset = None;
        let mut parameters = Vec::new();
        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (name, raw) = part.split_once('=').ok_or_else(|| {
                ProxyError::ContentType(format!("parameter '{}' has no value", part))
            })?;
            let name = name.trim();
            let raw = unquote(raw.trim());
            if name.eq_ignore_ascii_case("charset") {
                charset = Some(raw);
            } else {
                parameters.push((name.to_string(), raw));
            }
        }
        Self::new(mime, charset.as_deref(), parameters)
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn charset(&self) -> Option<&str> {
        self.charset.as_deref()
    }

    pub fn parameters(&self) -> &[(String, String)] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_multipart(&self) -> bool {
        self.mime.starts_with("multipart/")
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mime)?;
        if let Some(charset) = &self.charset {
            write!(f, "; charset={}", charset)?;
        }
        for (name, value) in &self.parameters {
            if is_token(value) {
                write!(f, "; {}={}", name, value)?;
            } else {
                write!(f, "; {}=\"{}\"", name, value.replace('\\', "\\\\").replace('"', "\\\""))?;
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for ContentType {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

/// Split on `sep` outside of double-quoted strings
fn split_unquoted(value: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (i, c) in value.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c == sep && !quoted => {
                parts.push(&value[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts
}

fn unquote(raw: &str) -> String {
    match raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(c) = chars.next() {
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                } else {
                    out.push(c);
                }
            }
            out
        }
        None => raw.to_string(),
    }
}
