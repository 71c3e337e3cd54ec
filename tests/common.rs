//! Common test utilities and helpers

use bytes::BytesMut;
use relay_proxy::protocol::{HttpResponse, ProtocolRegistry, ResponseDecoder};
use relay_proxy::server::{ProxyConfig, ProxyServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Duration, sleep, timeout};
use tokio_util::codec::Decoder;

/// Mock destination server
pub struct Origin {
    pub addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl Origin {
    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn authority(&self) -> String {
        format!("127.0.0.1:{}", self.addr.port())
    }
}

/// Start a proxy on an ephemeral port
pub async fn start_proxy(config: ProxyConfig) -> anyhow::Result<ProxyServer> {
    let server = ProxyServer::new(config.with_listen("127.0.0.1:0".parse()?))?;
    server.start().await?;
    Ok(server)
}

/// Origin answering each request with its head as the body.
///
/// `/slow` paths wait before answering, `/missing` gets a 404.
pub async fn spawn_origin() -> anyhow::Result<Origin> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(serve_origin_connection(stream));
        }
    });

    Ok(Origin { addr, connections })
}

/// Origin answering each connection once with a body ended by closing the socket
#[allow(dead_code)]
pub async fn spawn_close_delimited_origin(body: &'static str) -> anyhow::Result<Origin> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&chunk[..n]),
                    }
                }
                let reply = format!("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n{}", body);
                let _ = stream.write_all(reply.as_bytes()).await;
            });
        }
    });

    Ok(Origin { addr, connections })
}

async fn serve_origin_connection(mut stream: TcpStream) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head: Vec<u8> = buf.drain(..end + 4).collect();
            let text = String::from_utf8_lossy(&head).into_owned();
            let target = text.split(' ').nth(1).unwrap_or_default().to_string();

            if target.starts_with("/slow") {
                sleep(Duration::from_millis(300)).await;
            }
            let status = if target.starts_with("/missing") {
                "404 Not Found"
            } else {
                "200 OK"
            };
            let mut reply = format!(
                "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
                status,
                head.len()
            )
            .into_bytes();
            reply.extend_from_slice(&head);
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }
}

/// Write `raw` to the proxy and read back `count` responses
pub async fn exchange(
    proxy: SocketAddr,
    raw: &[u8],
    count: usize,
) -> anyhow::Result<Vec<HttpResponse>> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(raw).await?;
    read_responses(&mut stream, count).await
}

/// Read up to `count` responses, stopping early if the proxy closes
#[allow(dead_code)]
pub async fn read_responses(
    stream: &mut TcpStream,
    count: usize,
) -> anyhow::Result<Vec<HttpResponse>> {
    let mut decoder = ResponseDecoder::new(Arc::new(ProtocolRegistry::default()));
    let mut buffer = BytesMut::with_capacity(8192);
    let mut responses = Vec::new();

    timeout(Duration::from_secs(10), async {
        while responses.len() < count {
            if let Some(response) = decoder.decode(&mut buffer)? {
                responses.push(response);
                continue;
            }
            if stream.read_buf(&mut buffer).await? == 0 {
                if let Some(response) = decoder.decode_eof(&mut buffer)? {
                    responses.push(response);
                }
                break;
            }
        }
        anyhow::Ok(())
    })
    .await??;

    Ok(responses)
}

/// Absolute-form GET for `path` on `origin`
pub fn get_request(origin: &Origin, path: &str, extra_headers: &[(&str, &str)]) -> String {
    let mut request = format!(
        "GET http://{authority}{path} HTTP/1.1\r\nHost: {authority}\r\n",
        authority = origin.authority()
    );
    for (name, value) in extra_headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request
}

/// Body of a relayed response as text
#[allow(dead_code)]
pub fn body_text(response: &HttpResponse) -> String {
    response
        .body()
        .map(|body| String::from_utf8_lossy(body).into_owned())
        .unwrap_or_default()
}
