//! relay-proxy binary

use anyhow::{Context, Result};
use relay_proxy::server::{ProxyConfig, ProxyServer};
use relay_proxy::util::Authenticator;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const APP_NAME: &str = "relay-proxy";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Parse command line arguments
    let mut args = std::env::args().skip(1);
    let mut config = ProxyConfig::default();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-l" | "--listen" => {
                let value = args.next().context("Expected listen address after -l")?;
                config.listen = value
                    .parse::<SocketAddr>()
                    .with_context(|| format!("Invalid listen address: {}", value))?;
            }
            "-t" | "--timeout" => {
                let value = args.next().context("Expected seconds after --timeout")?;
                let secs = parse_u64(&value, "--timeout")?;
                config.request_timeout = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "--basic" => {
                let value = args.next().context("Expected USER:PASS after --basic")?;
                let (user, pass) = value
                    .split_once(':')
                    .context("--basic expects USER:PASS")?;
                config.authenticator = Some(Authenticator::basic_static(user, pass));
            }
            "--bearer" => {
                let token = args.next().context("Expected token after --bearer")?;
                config.authenticator = Some(Authenticator::bearer_static(token));
            }
            "--dns" => {
                let value = args
                    .next()
                    .context("Expected comma separated servers after --dns")?;
                config.dns_servers = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect();
            }
            "-V" | "--version" => {
                println!("{APP_NAME} {VERSION}");
                return Ok(());
            }
            "-h" | "--help" => {
                println!("Usage: relay-proxy [OPTIONS]");
                println!("Options:");
                println!("  -l, --listen ADDRESS    Listen address (default: 127.0.0.1:8080)");
                println!("  -t, --timeout SECS      Destination response timeout, 0 disables (default: 180)");
                println!("      --basic USER:PASS   Require Basic proxy authentication");
                println!("      --bearer TOKEN      Require Bearer proxy authentication");
                println!("      --dns SERVERS       Comma separated DNS servers (default: system)");
                println!("  -V, --version           Show version information");
                println!("  -h, --help              Show this help message");
                return Ok(());
            }
            _ => {
                error!("Unknown argument: {}", arg);
                return Err(anyhow::anyhow!("Unknown argument: {}", arg));
            }
        }
    }

    info!("[Server] {APP_NAME} v{VERSION}");
    if let Some(authenticator) = &config.authenticator {
        info!("[Server] Proxy authentication: {}", authenticator.scheme_name());
    }

    let server = ProxyServer::new(config).context("Invalid configuration")?;
    server.start().await.context("Failed to start proxy")?;
    info!("[Server] Proxy available at {}", server.proxy().url());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("[Server] Shutting down");
    server.stop().await;

    Ok(())
}

fn parse_u64(value: &str, flag: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|e| anyhow::anyhow!("{} expects a non-negative integer: {}", flag, e))
}
