//! Destination authority parsing: `[scheme://][user:pass@]host[:port][/path]`.

use crate::util::{ProxyError, Result};
use std::fmt;
use url::Host;

pub const HTTP_PORT: u16 = 80;
pub const HTTPS_PORT: u16 = 443;

/// Username/password pair; the password may itself contain `:`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Parse `user:pass`, splitting on the last `:`
    pub fn parse(userinfo: &str) -> Result<Self> {
        let (username, password) = userinfo
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::Authority("credentials must be user:password".into()))?;
        Ok(Self::new(username, password))
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Host, port and optional credentials identifying a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriAuthority {
    credentials: Option<Credentials>,
    host: String,
    port: u16,
}

impl UriAuthority {
    /// Build from already-normalized parts
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Ok(Self {
            credentials: None,
            host: normalize_host(host)?,
            port,
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Parse an authority or URL-like string.
    ///
    /// The port defaults to 443 for `https://` input and 80 otherwise; the
    /// host is always converted to its ASCII (punycode) form.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let (default_port, rest) = match input.find("://") {
            Some(idx) => {
                let scheme = &input[..idx];
                let port = if scheme.eq_ignore_ascii_case("https") {
                    HTTPS_PORT
                } else {
                    HTTP_PORT
                };
                (port, &input[idx + 3..])
            }
            None => (HTTP_PORT, input),
        };

        let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        let authority = &rest[..end];

        let (credentials, host_port) = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => (Some(Credentials::parse(userinfo)?), host_port),
            None => (None, authority),
        };

        let (host, port) = split_host_port(host_port)?;
        let port = match port {
            Some(port) => parse_port(port)?,
            None => default_port,
        };

        Ok(Self {
            credentials,
            host: normalize_host(host)?,
            port,
        })
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// ASCII host; IPv6 literals keep their brackets
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Host without IPv6 brackets, suitable for DNS resolution
    pub fn hostname(&self) -> &str {
        self.host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(&self.host)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Value for a `Host` header; the port is omitted when it is 80.
    pub fn host_header(&self) -> String {
        if self.port == HTTP_PORT {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for UriAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(credentials) = &self.credentials {
            write!(f, "{}:{}@", credentials.username, credentials.password)?;
        }
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::str::FromStr for UriAuthority {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn split_host_port(host_port: &str) -> Result<(&str, Option<&str>)> {
    if host_port.starts_with('[') {
        let close = host_port
            .find(']')
            .ok_or_else(|| ProxyError::Authority(format!("unterminated IPv6 literal in '{}'", host_port)))?;
        let host = &host_port[..=close];
        return match &host_port[close + 1..] {
            "" => Ok((host, None)),
            rest => match rest.strip_prefix(':') {
                Some(port) => Ok((host, Some(port))),
                None => Err(ProxyError::Authority(format!("unexpected '{}' after host", rest))),
            },
        };
    }
    Ok(match host_port.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (host_port, None),
    })
}

fn parse_port(port: &str) -> Result<u16> {
    let value: u32 = port
        .parse()
        .map_err(|_| ProxyError::Authority(format!("invalid port '{}'", port)))?;
    u16::try_from(value)
        .map_err(|_| ProxyError::Authority(format!("port {} is out of range", value)))
}

fn normalize_host(host: &str) -> Result<String> {
    if host.is_empty() {
        return Err(ProxyError::Authority("missing host".into()));
    }
    let parsed = Host::parse(host)
        .map_err(|e| ProxyError::Authority(format!("invalid host '{}': {}", host, e)))?;
    Ok(parsed.to_string())
}
