use anyhow::Result;
use relay_proxy::ProxyError;
use relay_proxy::server::{ProxyConfig, ProxyServer};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

mod common;
use common::{exchange, get_request, spawn_origin, start_proxy};

#[tokio::test]
async fn test_unreachable_destination_gets_400() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let closed = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = closed.local_addr()?.port();
    drop(closed);

    let proxy = start_proxy(ProxyConfig::default()).await?;
    let request = format!(
        "GET http://127.0.0.1:{port}/ HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n"
    );
    let responses = exchange(proxy.address(), request.as_bytes(), 1).await?;
    assert_eq!(responses[0].status().code(), 400);
    assert!(responses[0].headers().contains("Date"));
    assert_eq!(
        responses[0].headers().first_value("Content-Type"),
        Some("text/plain; charset=UTF-8")
    );

    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_missing_host_gets_400() -> Result<()> {
    let proxy = start_proxy(ProxyConfig::default()).await?;
    let responses = exchange(proxy.address(), b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n", 1).await?;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status().code(), 400);
    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_unsupported_version_gets_400() -> Result<()> {
    let proxy = start_proxy(ProxyConfig::default()).await?;
    let responses = exchange(proxy.address(), b"GET / HTTP/1.0\r\nHost: a\r\n\r\n", 1).await?;
    assert_eq!(responses[0].status().code(), 400);
    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_new_connections_disabled_gets_400() -> Result<()> {
    let origin = spawn_origin().await?;
    let proxy = start_proxy(ProxyConfig::default().with_new_connections(false)).await?;

    let request = get_request(&origin, "/", &[]);
    let responses = exchange(proxy.address(), request.as_bytes(), 1).await?;
    assert_eq!(responses[0].status().code(), 400);
    assert_eq!(origin.connections(), 0);

    proxy.set_new_connections_allowed(true);
    let responses = exchange(proxy.address(), request.as_bytes(), 1).await?;
    assert_eq!(responses[0].status().code(), 200);

    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_destination_timeout_gets_400() -> Result<()> {
    let origin = spawn_origin().await?;
    let config = ProxyConfig::default().with_request_timeout(Some(Duration::from_millis(50)));
    let proxy = start_proxy(config).await?;

    let request = get_request(&origin, "/slow", &[]);
    let responses = exchange(proxy.address(), request.as_bytes(), 1).await?;
    assert_eq!(responses[0].status().code(), 400);

    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_method_gets_400() -> Result<()> {
    let proxy = start_proxy(ProxyConfig::default()).await?;
    let responses = exchange(
        proxy.address(),
        b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n",
        1,
    )
    .await?;
    assert_eq!(responses[0].status().code(), 400);
    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_oversized_content_length_gets_400() -> Result<()> {
    let proxy = start_proxy(ProxyConfig::default()).await?;
    let responses = exchange(
        proxy.address(),
        b"POST http://a/ HTTP/1.1\r\nHost: a\r\nContent-Length: 18446744073709551615\r\n\r\nab",
        1,
    )
    .await?;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status().code(), 400);

    for _ in 0..100 {
        if proxy.clients().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(proxy.clients().is_empty());

    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_client_reset_reaches_error_handler() -> Result<()> {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let proxy = ProxyServer::new(ProxyConfig::default().with_listen("127.0.0.1:0".parse()?))?
        .with_error_handler(move |error: &ProxyError| {
            if matches!(error, ProxyError::Io(_)) {
                sink.lock().unwrap().push(error.to_string());
            }
        });
    proxy.start().await?;

    let mut client = TcpStream::connect(proxy.address()).await?;
    client.write_all(b"GET http://").await?;
    socket2::SockRef::from(&client).set_linger(Some(Duration::ZERO))?;
    drop(client);

    for _ in 0..200 {
        if !seen.lock().unwrap().is_empty() && proxy.clients().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(proxy.clients().is_empty());

    proxy.stop().await;
    Ok(())
}
