//! Destination resolution with a small TTL cache.
//!
//! Each proxy owns its own resolver; nothing here is process-wide.

use crate::util::{ProxyError, Result};
use std::collections::HashMap;
use std::io::{Error, ErrorKind};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::lookup_host;
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use trust_dns_resolver::TokioAsyncResolver;
use trust_dns_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};

/// TTL for cached DNS entries.
const DEFAULT_TTL: Duration = Duration::from_secs(60);
/// Timeout for DNS lookup operations.
const DNS_TIMEOUT: Duration = Duration::from_secs(10);

struct CacheEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
    next_index: usize,
}

/// Resolves destination hosts, through the system resolver or a set of
/// custom name servers.
pub struct DestinationResolver {
    cache: RwLock<HashMap<String, CacheEntry>>,
    custom: Option<TokioAsyncResolver>,
    ttl: Duration,
}

impl Default for DestinationResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationResolver {
    /// Resolver backed by the system's name resolution
    pub fn new() -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            custom: None,
            ttl: DEFAULT_TTL,
        }
    }

    /// Resolver querying `servers` (`ip`, `ip:port` or `[v6]`) over UDP and TCP.
    /// An empty list falls back to the system resolver.
    pub fn with_name_servers(servers: &[String]) -> Result<Self> {
        let mut parsed = Vec::new();
        for raw in servers {
            let socket = parse_dns_server(raw)
                .map_err(|err| ProxyError::Config(format!("Invalid DNS server '{}': {}", raw, err)))?;
            parsed.push(socket);
        }

        if parsed.is_empty() {
            info!("[DNS] Using system DNS resolver");
            return Ok(Self::new());
        }

        let mut config = ResolverConfig::new();
        for server in &parsed {
            config.add_name_server(NameServerConfig::new(*server, Protocol::Udp));
            config.add_name_server(NameServerConfig::new(*server, Protocol::Tcp));
        }

        info!(
            "[DNS] Custom DNS servers configured: {}",
            parsed
                .iter()
                .map(|addr| addr.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            custom: Some(TokioAsyncResolver::tokio(config, ResolverOpts::default())),
            ..Self::new()
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Resolve `host` to a socket address, rotating through cached results.
    /// Bracketed IPv6 literals are accepted.
    pub async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        if let Some(ip) = self.cached(host).await {
            return Ok(SocketAddr::new(ip, port));
        }

        let mut addresses = self.lookup(host, port).await?;
        if addresses.is_empty() {
            return Err(ProxyError::Resolve(format!("No address found for {}", host)));
        }

        // Stable order keeps the round-robin predictable
        addresses.sort_unstable_by_key(|ip| match ip {
            IpAddr::V4(ip) => (0, ip.octets().to_vec()),
            IpAddr::V6(ip) => (1, ip.octets().to_vec()),
        });
        addresses.dedup();

        debug!(
            "[DNS] Resolved {} -> {} entries (ttl={}s)",
            host,
            addresses.len(),
            self.ttl.as_secs()
        );

        let first = addresses[0];
        self.cache.write().await.insert(
            host.to_ascii_lowercase(),
            CacheEntry {
                addresses,
                expires_at: Instant::now() + self.ttl,
                next_index: 1,
            },
        );
        Ok(SocketAddr::new(first, port))
    }

    /// Drop every cached entry
    pub async fn clear(&self) {
        self.cache.write().await.clear();
    }

    async fn cached(&self, host: &str) -> Option<IpAddr> {
        let mut cache = self.cache.write().await;
        let key = host.to_ascii_lowercase();
        let entry = cache.get_mut(&key)?;
        if Instant::now() > entry.expires_at || entry.addresses.is_empty() {
            cache.remove(&key);
            return None;
        }
        let ip = entry.addresses[entry.next_index % entry.addresses.len()];
        entry.next_index = entry.next_index.wrapping_add(1);
        trace!("[DNS] Cache hit for {} -> {}", host, ip);
        Some(ip)
    }

    async fn lookup(&self, host: &str, port: u16) -> Result<Vec<IpAddr>> {
        let timeout = || {
            ProxyError::Resolve(format!(
                "DNS resolution timeout ({}s) for {}",
                DNS_TIMEOUT.as_secs(),
                host
            ))
        };
        match &self.custom {
            Some(resolver) => {
                let lookup = tokio::time::timeout(DNS_TIMEOUT, resolver.lookup_ip(host))
                    .await
                    .map_err(|_| timeout())?
                    .map_err(|err| {
                        ProxyError::Resolve(format!("DNS resolution failed for {}: {}", host, err))
                    })?;
                Ok(lookup.iter().collect())
            }
            None => {
                let addrs = tokio::time::timeout(DNS_TIMEOUT, lookup_host((host, port)))
                    .await
                    .map_err(|_| timeout())?
                    .map_err(|err| {
                        ProxyError::Resolve(format!("DNS resolution failed for {}: {}", host, err))
                    })?;
                Ok(addrs.map(|addr| addr.ip()).collect())
            }
        }
    }
}

fn parse_dns_server(entry: &str) -> std::io::Result<SocketAddr> {
    let trimmed = entry.trim();
    if trimmed.is_empty() {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "DNS server address is empty",
        ));
    }

    if let Ok(addr) = trimmed.parse::<SocketAddr>() {
        return Ok(addr);
    }

    // IPv6 without port (e.g., "2001:4860:4860::8888")
    if let Ok(ip) = trimmed.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, 53));
    }

    // Bracketed IPv6 without port (e.g., "[2001:4860:4860::8888]")
    if trimmed.starts_with('[')
        && trimmed.ends_with(']')
        && let Ok(ip) = trimmed[1..trimmed.len() - 1].parse::<IpAddr>()
    {
        return Ok(SocketAddr::new(ip, 53));
    }

    Err(Error::new(
        ErrorKind::InvalidInput,
        format!("invalid DNS server '{}'", entry),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ip_literals_skip_lookup() {
        let resolver = DestinationResolver::new();
        let addr = resolver.resolve("10.1.2.3", 8080).await.unwrap();
        assert_eq!(addr, "10.1.2.3:8080".parse().unwrap());
        let addr = resolver.resolve("[::1]", 80).await.unwrap();
        assert_eq!(addr, "[::1]:80".parse().unwrap());
    }

    #[tokio::test]
    async fn test_localhost_is_cached() {
        let resolver = DestinationResolver::new();
        let addr = resolver.resolve("localhost", 9000).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert!(resolver.cached("LOCALHOST").await.is_some());
        resolver.clear().await;
        assert!(resolver.cached("localhost").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_are_dropped() {
        let resolver = DestinationResolver::new().with_ttl(Duration::ZERO);
        resolver.resolve("localhost", 80).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(resolver.cached("localhost").await.is_none());
    }

    #[test]
    fn test_parse_dns_server_forms() {
        assert_eq!(parse_dns_server("1.1.1.1").unwrap(), "1.1.1.1:53".parse().unwrap());
        assert_eq!(parse_dns_server("8.8.8.8:5353").unwrap(), "8.8.8.8:5353".parse().unwrap());
        assert_eq!(
            parse_dns_server("[2001:4860:4860::8888]").unwrap().port(),
            53
        );
        assert!(parse_dns_server("").is_err());
        assert!(parse_dns_server("dns.example").is_err());
    }

    #[test]
    fn test_invalid_custom_servers_are_config_errors() {
        let err = DestinationResolver::with_name_servers(&["nope".to_string()]).err().unwrap();
        assert!(matches!(err, ProxyError::Config(_)));
    }
}
