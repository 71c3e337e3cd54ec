use anyhow::Result;
use relay_proxy::server::ProxyConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

mod common;
use common::{body_text, exchange, get_request, read_responses, spawn_origin, start_proxy};

#[tokio::test]
async fn test_pipelined_requests_share_one_destination_connection() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let origin = spawn_origin().await?;
    let proxy = start_proxy(ProxyConfig::default()).await?;

    let raw: String = (1..=3)
        .map(|i| get_request(&origin, &format!("/item/{}", i), &[]))
        .collect();
    let responses = exchange(proxy.address(), raw.as_bytes(), 3).await?;

    assert_eq!(responses.len(), 3);
    for (i, response) in responses.iter().enumerate() {
        assert_eq!(response.status().code(), 200);
        assert!(body_text(response).starts_with(&format!("GET /item/{} ", i + 1)));
    }
    assert_eq!(origin.connections(), 1);

    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_sequential_requests_reuse_connection() -> Result<()> {
    let origin = spawn_origin().await?;
    let proxy = start_proxy(ProxyConfig::default()).await?;

    let mut stream = TcpStream::connect(proxy.address()).await?;
    for path in ["/a", "/b"] {
        stream
            .write_all(get_request(&origin, path, &[]).as_bytes())
            .await?;
        let responses = read_responses(&mut stream, 1).await?;
        assert!(body_text(&responses[0]).starts_with(&format!("GET {} ", path)));
    }
    assert_eq!(origin.connections(), 1);
    assert_eq!(proxy.clients().len(), 1);
    assert_eq!(proxy.clients()[0].connection_count(), 1);

    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_responses_keep_request_order_across_destinations() -> Result<()> {
    let slow = spawn_origin().await?;
    let fast = spawn_origin().await?;
    let proxy = start_proxy(ProxyConfig::default()).await?;

    let raw = format!(
        "{}{}",
        get_request(&slow, "/slow", &[]),
        get_request(&fast, "/fast", &[])
    );
    let responses = exchange(proxy.address(), raw.as_bytes(), 2).await?;

    assert_eq!(responses.len(), 2);
    assert!(body_text(&responses[0]).starts_with("GET /slow "));
    assert!(body_text(&responses[1]).starts_with("GET /fast "));

    proxy.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_anonymous_requests_use_separate_connection() -> Result<()> {
    let origin = spawn_origin().await?;
    let proxy = start_proxy(ProxyConfig::default()).await?;

    let raw = format!(
        "{}{}",
        get_request(&origin, "/named", &[("X-Forwarded-For", "10.9.9.9")]),
        get_request(
            &origin,
            "/anonymous",
            &[("Proxy-Anonymous", "true"), ("X-Forwarded-For", "10.9.9.9")]
        )
    );
    let responses = exchange(proxy.address(), raw.as_bytes(), 2).await?;

    let named = body_text(&responses[0]);
    assert!(named.contains("X-Forwarded-For: 10.9.9.9, 127.0.0.1"), "{}", named);
    let anonymous = body_text(&responses[1]);
    assert!(!anonymous.contains("X-Forwarded-For"));
    assert!(!anonymous.contains("Via:"));
    assert!(!anonymous.contains("Proxy-Anonymous"));
    assert_eq!(origin.connections(), 2);

    proxy.stop().await;
    Ok(())
}
