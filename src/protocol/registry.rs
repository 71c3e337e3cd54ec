//! Explicit registry of protocol codecs, built once at startup.

use crate::protocol::codec::{Http11Codec, HttpCodec};
use crate::protocol::header::HeaderRegistry;
use crate::util::{ProxyError, Result};
use std::fmt;
use std::sync::Arc;

pub struct ProtocolRegistry {
    codecs: Vec<Arc<dyn HttpCodec>>,
}

impl ProtocolRegistry {
    /// A registry with no codecs
    pub fn empty() -> Self {
        Self { codecs: Vec::new() }
    }

    /// A registry holding the HTTP/1.1 codec backed by `headers`
    pub fn with_headers(headers: Arc<HeaderRegistry>) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Http11Codec::new(headers)));
        registry
    }

    /// Register a codec; a codec for the same version is replaced.
    pub fn register(&mut self, codec: Arc<dyn HttpCodec>) {
        self.codecs.retain(|c| c.version() != codec.version());
        self.codecs.push(codec);
    }

    pub fn get(&self, version: &str) -> Option<Arc<dyn HttpCodec>> {
        self.codecs.iter().find(|c| c.version() == version).cloned()
    }

    /// First registered codec accepting `bytes`
    pub fn select(&self, bytes: &[u8]) -> Result<Arc<dyn HttpCodec>> {
        self.codecs
            .iter()
            .find(|c| c.is_compatible(bytes))
            .cloned()
            .ok_or_else(|| ProxyError::Parse("no registered protocol version accepts the message".into()))
    }

    /// Codec used for messages the proxy writes itself
    pub fn default_codec(&self) -> Result<Arc<dyn HttpCodec>> {
        self.codecs
            .first()
            .cloned()
            .ok_or_else(|| ProxyError::Config("no protocol codec registered".into()))
    }

    pub fn versions(&self) -> Vec<&str> {
        self.codecs.iter().map(|c| c.version()).collect()
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("versions", &self.versions())
            .finish()
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::with_headers(Arc::new(HeaderRegistry::default()))
    }
}
