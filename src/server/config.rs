//! Proxy configuration and the shared state handed to every session

use crate::protocol::registry::ProtocolRegistry;
use crate::util::{Authenticator, DestinationResolver, Result};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8080";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(180);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub listen: SocketAddr,
    /// Upper bound on waiting for a destination response; `None` waits forever
    pub request_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Whether sessions may open connections to destinations they have not used yet
    pub allow_new_connections: bool,
    pub authenticator: Option<Authenticator>,
    /// Custom DNS servers; empty uses the system resolver
    pub dns_servers: Vec<String>,
    pub protocols: Arc<ProtocolRegistry>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            allow_new_connections: true,
            authenticator: None,
            dns_servers: Vec::new(),
            protocols: Arc::new(ProtocolRegistry::default()),
        }
    }
}

impl ProxyConfig {
    pub fn with_listen(mut self, listen: SocketAddr) -> Self {
        self.listen = listen;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_new_connections(mut self, allowed: bool) -> Self {
        self.allow_new_connections = allowed;
        self
    }

    pub fn with_authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    pub fn with_dns_servers(mut self, servers: Vec<String>) -> Self {
        self.dns_servers = servers;
        self
    }

    pub fn with_protocols(mut self, protocols: Arc<ProtocolRegistry>) -> Self {
        self.protocols = protocols;
        self
    }
}

/// State shared by all sessions of one proxy
pub struct ProxyContext {
    protocols: Arc<ProtocolRegistry>,
    resolver: DestinationResolver,
    authenticator: Option<Authenticator>,
    request_timeout: Option<Duration>,
    connect_timeout: Duration,
    new_connections: AtomicBool,
}

impl ProxyContext {
    pub fn new(config: &ProxyConfig) -> Result<Self> {
        Ok(Self {
            protocols: Arc::clone(&config.protocols),
            resolver: DestinationResolver::with_name_servers(&config.dns_servers)?,
            authenticator: config.authenticator.clone(),
            request_timeout: config.request_timeout,
            connect_timeout: config.connect_timeout,
            new_connections: AtomicBool::new(config.allow_new_connections),
        })
    }

    pub fn protocols(&self) -> &Arc<ProtocolRegistry> {
        &self.protocols
    }

    pub fn resolver(&self) -> &DestinationResolver {
        &self.resolver
    }

    pub fn authenticator(&self) -> Option<&Authenticator> {
        self.authenticator.as_ref()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn new_connections_allowed(&self) -> bool {
        self.new_connections.load(Ordering::Relaxed)
    }

    pub fn set_new_connections_allowed(&self, allowed: bool) {
        self.new_connections.store(allowed, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Http,
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyType::Http => f.write_str("http"),
        }
    }
}

/// Where and how clients reach a running proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proxy {
    pub address: SocketAddr,
    pub proxy_type: ProxyType,
}

impl Proxy {
    pub fn http(address: SocketAddr) -> Self {
        Self {
            address,
            proxy_type: ProxyType::Http,
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.proxy_type, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(config.request_timeout, Some(Duration::from_secs(180)));
        assert!(config.allow_new_connections);
        assert!(config.authenticator.is_none());
    }

    #[test]
    fn test_context_toggles_new_connections() {
        let config = ProxyConfig::default().with_new_connections(false);
        let context = ProxyContext::new(&config).unwrap();
        assert!(!context.new_connections_allowed());
        context.set_new_connections_allowed(true);
        assert!(context.new_connections_allowed());
    }

    #[test]
    fn test_bad_dns_server_rejected() {
        let config = ProxyConfig::default().with_dns_servers(vec!["not-an-ip".into()]);
        assert!(ProxyContext::new(&config).is_err());
    }

    #[test]
    fn test_proxy_url() {
        let proxy = Proxy::http("127.0.0.1:3128".parse().unwrap());
        assert_eq!(proxy.url(), "http://127.0.0.1:3128");
    }
}
