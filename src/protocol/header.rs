//! Header model: case-insensitive keys, name/value pairs and the ordered
//! header collection carried by requests and responses.

use crate::util::{ProxyError, Result};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;

pub const HOST: &str = "Host";
pub const CONTENT_TYPE: &str = "Content-Type";
pub const CONTENT_LENGTH: &str = "Content-Length";
pub const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub const CONNECTION: &str = "Connection";
pub const PROXY_CONNECTION: &str = "Proxy-Connection";
pub const KEEP_ALIVE: &str = "Keep-Alive";
pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";
pub const PROXY_AUTHENTICATE: &str = "Proxy-Authenticate";
pub const AUTHORIZATION: &str = "Authorization";
pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
pub const UPGRADE: &str = "Upgrade";
pub const LOCATION: &str = "Location";
pub const ALLOW: &str = "Allow";
pub const DATE: &str = "Date";
pub const VIA: &str = "Via";
pub const FORWARDED: &str = "Forwarded";
pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
pub const X_FORWARDED_HOST: &str = "X-Forwarded-Host";
pub const X_FORWARDED_PROTO: &str = "X-Forwarded-Proto";
pub const X_REAL_IP: &str = "X-Real-IP";
pub const FROM: &str = "From";
pub const TE: &str = "TE";
pub const TRAILER: &str = "Trailer";
/// Internal marker asking the proxy to forward without client-identifying headers.
pub const PROXY_ANONYMOUS: &str = "Proxy-Anonymous";

/// Returns true if `name` is a syntactically valid header name
/// (`^[A-Za-z][A-Za-z0-9-]*$`).
pub fn is_valid_name(name: &str) -> bool {
    let mut bytes = name.bytes();
    match bytes.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// A header identifier compared case-insensitively, with an optional
/// pattern its values must match.
#[derive(Debug, Clone)]
pub struct HeaderKey {
    name: String,
    pattern: Option<Regex>,
}

impl HeaderKey {
    /// Create a key without value validation
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(ProxyError::Parse(format!("invalid header name '{}'", name)));
        }
        Ok(Self {
            name,
            pattern: None,
        })
    }

    /// Create a key whose values must match `pattern`
    pub fn with_pattern(name: impl Into<String>, pattern: &str) -> Result<Self> {
        let mut key = Self::new(name)?;
        let regex = Regex::new(pattern).map_err(|e| {
            ProxyError::Config(format!("invalid pattern for header {}: {}", key.name, e))
        })?;
        key.pattern = Some(regex);
        Ok(key)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> Option<&Regex> {
        self.pattern.as_ref()
    }

    /// Case-insensitive comparison against a raw header name
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Check a value against the key's pattern; keys without one accept anything.
    pub fn validate(&self, value: &str) -> Result<()> {
        match &self.pattern {
            Some(pattern) if !pattern.is_match(value) => Err(ProxyError::Parse(format!(
                "value '{}' is not valid for header {}",
                value, self.name
            ))),
            _ => Ok(()),
        }
    }
}

impl PartialEq for HeaderKey {
    fn eq(&self, other: &Self) -> bool {
        self.matches(&other.name)
    }
}

impl Eq for HeaderKey {}

impl fmt::Display for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Registry of well-known header keys.
///
/// Constructed explicitly and handed to the codec, so custom keys can be
/// registered per proxy instance.
#[derive(Debug, Clone)]
pub struct HeaderRegistry {
    keys: HashMap<String, HeaderKey>,
}

impl HeaderRegistry {
    /// An empty registry
    pub fn empty() -> Self {
        Self {
            keys: HashMap::new(),
        }
    }

    /// Add or replace a key
    pub fn register(&mut self, key: HeaderKey) {
        self.keys.insert(key.name.to_ascii_lowercase(), key);
    }

    pub fn get(&self, name: &str) -> Option<&HeaderKey> {
        self.keys.get(&name.to_ascii_lowercase())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Validate a value against the registered key for `name`, if any
    pub fn validate(&self, name: &str, value: &str) -> Result<()> {
        match self.get(name) {
            Some(key) => key.validate(value),
            None => Ok(()),
        }
    }
}

const TOKEN_LIST: &str = r"^[!#$%&'*+.^_`|~0-9A-Za-z-]+(\s*,\s*[!#$%&'*+.^_`|~0-9A-Za-z-]+)*$";

impl Default for HeaderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        let builtins: &[(&str, Option<&str>)] = &[
            (HOST, Some(r"^\S+$")),
            (CONTENT_TYPE, None),
            (CONTENT_LENGTH, Some(r"^\d+$")),
            (TRANSFER_ENCODING, Some(TOKEN_LIST)),
            (CONNECTION, Some(TOKEN_LIST)),
            (PROXY_CONNECTION, Some(TOKEN_LIST)),
            (KEEP_ALIVE, None),
            (PROXY_AUTHORIZATION, None),
            (PROXY_AUTHENTICATE, None),
            (AUTHORIZATION, None),
            (WWW_AUTHENTICATE, None),
            (UPGRADE, None),
            (LOCATION, None),
            (ALLOW, None),
            (DATE, None),
            (VIA, None),
            (X_FORWARDED_FOR, None),
            (PROXY_ANONYMOUS, Some(r"^(?i:true|false)$")),
        ];
        for (name, pattern) in builtins {
            let key = match pattern {
                Some(pattern) => HeaderKey::with_pattern(*name, pattern),
                None => HeaderKey::new(*name),
            };
            // Built-in names and patterns are static and known to be valid.
            if let Ok(key) = key {
                registry.register(key);
            }
        }
        registry
    }
}

/// A single `name: value` pair; names compare case-insensitively.
#[derive(Debug, Clone, Eq)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(ProxyError::Parse(format!("invalid header name '{}'", name)));
        }
        Ok(Self {
            name,
            value: value.into(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether this header carries the given name
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.is(&other.name) && self.value == other.value
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Insertion-ordered header collection.
///
/// Lookups are case-insensitive; `last` means most recently added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn add(&mut self, header: Header) {
        self.0.push(header);
    }

    /// Validate and append a header
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.add(Header::new(name, value)?);
        Ok(())
    }

    /// Replace every header named `name` with a single value
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        self.remove(name);
        self.insert(name, value)
    }

    /// Append a header whose name is one of the well-known constants.
    ///
    /// The constants are valid names, so no validation is needed.
    pub fn append(&mut self, name: &'static str, value: impl Into<String>) {
        debug_assert!(is_valid_name(name), "invalid header constant '{}'", name);
        self.add(Header {
            name: name.to_string(),
            value: value.into(),
        });
    }

    /// [`Headers::set`] for the well-known constants
    pub fn replace(&mut self, name: &'static str, value: impl Into<String>) {
        self.remove(name);
        self.append(name, value);
    }

    /// Remove all headers named `name`, returning them in order
    pub fn remove(&mut self, name: &str) -> Vec<Header> {
        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.0).into_iter().partition(|h| h.is(name));
        self.0 = kept;
        removed
    }

    pub fn remove_key(&mut self, key: &HeaderKey) -> Vec<Header> {
        self.remove(key.name())
    }

    pub fn first(&self, name: &str) -> Option<&Header> {
        self.0.iter().find(|h| h.is(name))
    }

    pub fn last(&self, name: &str) -> Option<&Header> {
        self.0.iter().rev().find(|h| h.is(name))
    }

    pub fn first_value(&self, name: &str) -> Option<&str> {
        self.first(name).map(Header::value)
    }

    pub fn count(&self, name: &str) -> usize {
        self.0.iter().filter(|h| h.is(name)).count()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|h| h.is(name))
    }

    pub fn contains_key(&self, key: &HeaderKey) -> bool {
        self.contains(key.name())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Header> + 'a {
        self.0.iter().filter(move |h| h.is(name))
    }

    /// True if any comma-separated token of any `name` header equals `token`
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|h| h.value().split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl FromIterator<Header> for Headers {
    fn from_iter<I: IntoIterator<Item = Header>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
