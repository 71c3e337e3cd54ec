//! Connection from the proxy to one destination.
//!
//! Responses carry no correlation id: the read loop hands each parsed
//! response to the oldest pending request, so destinations must answer in
//! request order.

use crate::protocol::codec::{HttpCodec, ResponseDecoder};
use crate::protocol::message::{HttpRequest, HttpResponse, Method};
use crate::protocol::registry::ProtocolRegistry;
use crate::protocol::status::StatusCategory;
use crate::util::{ProxyError, Result, configure_tcp_stream};
use bytes::BytesMut;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::oneshot;
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Closed,
}

pub type ResponseReceiver = oneshot::Receiver<Result<HttpResponse>>;

struct PendingResponse {
    bodyless: bool,
    tx: oneshot::Sender<Result<HttpResponse>>,
}

pub struct OutboundConnection {
    id: u64,
    addr: SocketAddr,
    keep_alive: bool,
    lazy_connect: bool,
    connect_timeout: Duration,
    registry: Arc<ProtocolRegistry>,
    state: Mutex<ConnectionState>,
    // Held across connect and each request write, so queue order is wire order
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: Mutex<VecDeque<PendingResponse>>,
    // Set once the destination will not answer further requests
    retiring: AtomicBool,
    cancel: CancellationToken,
}

impl OutboundConnection {
    pub fn new(addr: SocketAddr, registry: Arc<ProtocolRegistry>) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            keep_alive: true,
            lazy_connect: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            registry,
            state: Mutex::new(ConnectionState::Unconnected),
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            retiring: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Connect on the first write instead of requiring [`connect`](Self::connect)
    pub fn with_lazy_connect(mut self, lazy: bool) -> Self {
        self.lazy_connect = lazy;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Cancel the read loop together with `parent`
    pub fn with_parent_token(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Whether requests may still be written on this connection
    pub fn is_usable(&self) -> bool {
        if self.retiring.load(Ordering::Acquire) {
            return false;
        }
        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => true,
            ConnectionState::Unconnected => self.lazy_connect,
            ConnectionState::Closed => false,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, VecDeque<PendingResponse>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open the socket and start the response read loop.
    ///
    /// Fails with [`ProxyError::AlreadyConnected`] if the connection is up.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        self.connect_locked(&mut writer).await
    }

    async fn connect_locked(self: &Arc<Self>, writer: &mut Option<OwnedWriteHalf>) -> Result<()> {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Connecting => {
                return Err(ProxyError::AlreadyConnected(self.addr));
            }
            ConnectionState::Closed => return Err(ProxyError::NotConnected(self.addr)),
            ConnectionState::Unconnected => {}
        }
        self.set_state(ConnectionState::Connecting);

        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.set_state(ConnectionState::Unconnected);
                tracing::debug!("[Outbound] Connect to {} failed: {}", self.addr, e);
                return Err(e.into());
            }
            Err(_) => {
                self.set_state(ConnectionState::Unconnected);
                tracing::debug!("[Outbound] Connect to {} timed out", self.addr);
                return Err(ProxyError::Timeout(self.connect_timeout));
            }
        };
        configure_tcp_stream(&stream, "outbound connection");

        let (reader, write_half) = stream.into_split();
        *writer = Some(write_half);
        self.set_state(ConnectionState::Connected);
        tracing::debug!("[Outbound] Connection {} established to {}", self.id, self.addr);

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.read_loop(reader).await;
        });
        Ok(())
    }

    /// Serialize and write `request`, returning a receiver for its response.
    pub async fn write(self: &Arc<Self>, request: &HttpRequest) -> Result<ResponseReceiver> {
        let bytes = self.codec_for(request.version())?.serialize_request(request)?;

        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            if self.lazy_connect && self.state() == ConnectionState::Unconnected {
                self.connect_locked(&mut writer).await?;
            } else {
                return Err(ProxyError::NotConnected(self.addr));
            }
        }
        let Some(stream) = writer.as_mut() else {
            return Err(ProxyError::NotConnected(self.addr));
        };

        let (tx, rx) = oneshot::channel();
        self.lock_pending().push_back(PendingResponse {
            bodyless: request.method() == Method::Head,
            tx,
        });

        let written = stream.write_all(&bytes).await;
        drop(writer);
        if let Err(e) = written {
            tracing::debug!("[Outbound] Write to {} failed: {}", self.addr, e);
            self.close().await;
            return Err(e.into());
        }
        tracing::trace!(
            "[Outbound] Connection {} wrote {} {} ({} bytes)",
            self.id,
            request.method(),
            request.path(),
            bytes.len()
        );
        Ok(rx)
    }

    /// Write `request` and wait for its response, up to `timeout` if given
    pub async fn send(
        self: &Arc<Self>,
        request: &HttpRequest,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse> {
        let rx = self.write(request).await?;
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| ProxyError::Timeout(limit))?,
            None => rx.await,
        };
        received.map_err(|_| ProxyError::Interrupted("response channel dropped".into()))?
    }

    /// Close the socket and fail every pending request
    pub async fn close(&self) {
        let was = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, ConnectionState::Closed)
        };
        self.cancel.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        let failed = self.fail_pending("connection closed");
        if was != ConnectionState::Closed {
            tracing::debug!(
                "[Outbound] Connection {} to {} closed ({} pending failed)",
                self.id,
                self.addr,
                failed
            );
        }
    }

    fn fail_pending(&self, reason: &str) -> usize {
        let drained: Vec<_> = self.lock_pending().drain(..).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.tx.send(Err(ProxyError::Interrupted(reason.to_string())));
        }
        count
    }

    fn codec_for(&self, version: &str) -> Result<Arc<dyn HttpCodec>> {
        match self.registry.get(version) {
            Some(codec) => Ok(codec),
            None => self.registry.default_codec(),
        }
    }

    fn front_is_bodyless(&self) -> bool {
        self.lock_pending().front().is_some_and(|p| p.bodyless)
    }

    /// Hand a response to the oldest pending request. Returns false when the
    /// connection must not carry further exchanges.
    fn deliver(&self, response: HttpResponse) -> bool {
        let status = response.status().code();
        if response.status().category() == StatusCategory::Informational && status != 101 {
            tracing::trace!("[Outbound] Connection {} skipping interim {}", self.id, status);
            return true;
        }
        let reusable = status != 101 && response.keep_alive();
        if !reusable {
            self.retiring.store(true, Ordering::Release);
        }
        match self.lock_pending().pop_front() {
            Some(pending) => {
                let _ = pending.tx.send(Ok(response));
            }
            None => {
                tracing::warn!(
                    "[Outbound] Connection {} got unsolicited {} response from {}",
                    self.id,
                    status,
                    self.addr
                );
            }
        }
        reusable
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut decoder = ResponseDecoder::new(Arc::clone(&self.registry));
        let mut buffer = BytesMut::with_capacity(8192);

        'read: loop {
            let read = tokio::select! {
                _ = self.cancel.cancelled() => break,
                read = reader.read_buf(&mut buffer) => read,
            };
            let n = match read {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!("[Outbound] Connection {} read error: {}", self.id, e);
                    break;
                }
            };

            if n == 0 {
                self.retiring.store(true, Ordering::Release);
                decoder.expect_bodyless(self.front_is_bodyless());
                match decoder.decode_eof(&mut buffer) {
                    Ok(Some(response)) => {
                        self.deliver(response);
                    }
                    Ok(None) => {}
                    Err(e) => self.fail_front(e),
                }
                tracing::debug!("[Outbound] Connection {} closed by {}", self.id, self.addr);
                break;
            }

            loop {
                decoder.expect_bodyless(self.front_is_bodyless());
                match decoder.decode(&mut buffer) {
                    Ok(Some(response)) => {
                        if !self.deliver(response) {
                            break 'read;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(
                            "[Outbound] Connection {} got malformed response: {}",
                            self.id,
                            e
                        );
                        self.fail_front(e);
                        break 'read;
                    }
                }
            }
        }

        self.close().await;
    }

    fn fail_front(&self, error: ProxyError) {
        if let Some(pending) = self.lock_pending().pop_front() {
            let _ = pending.tx.send(Err(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn get(path: &str) -> HttpRequest {
        HttpRequest::new(Method::Get, path)
            .with_header("Host", "origin.test")
            .unwrap()
    }

    async fn read_requests(stream: &mut TcpStream, count: usize) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        while String::from_utf8_lossy(&buf).matches("\r\n\r\n").count() < count {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Origin that reads `count` requests, then writes `reply` once
    async fn origin(count: usize, reply: &'static [u8]) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_requests(&mut stream, count).await;
            stream.write_all(reply).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        addr
    }

    fn connection(addr: SocketAddr) -> Arc<OutboundConnection> {
        Arc::new(OutboundConnection::new(addr, Arc::new(ProtocolRegistry::default())))
    }

    #[tokio::test]
    async fn test_responses_follow_request_order() {
        let addr = origin(
            2,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfirstHTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecond",
        )
        .await;
        let conn = connection(addr);
        conn.connect().await.unwrap();

        let first = conn.write(&get("/1")).await.unwrap();
        let second = conn.write(&get("/2")).await.unwrap();
        assert_eq!(conn.pending_count(), 2);

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.body().unwrap().as_ref(), b"first");
        assert_eq!(second.body().unwrap().as_ref(), b"second");
        assert_eq!(conn.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let addr = origin(1, b"").await;
        let conn = connection(addr);
        conn.connect().await.unwrap();
        assert!(matches!(
            conn.connect().await,
            Err(ProxyError::AlreadyConnected(a)) if a == addr
        ));
    }

    #[tokio::test]
    async fn test_write_requires_connection() {
        let addr = origin(1, b"").await;
        let conn = connection(addr);
        assert!(matches!(
            conn.write(&get("/")).await,
            Err(ProxyError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_lazy_connection_connects_on_write() {
        let addr = origin(1, b"HTTP/1.1 204 No Content\r\n\r\n").await;
        let conn = Arc::new(
            OutboundConnection::new(addr, Arc::new(ProtocolRegistry::default()))
                .with_lazy_connect(true),
        );
        assert!(conn.is_usable());
        let response = conn.send(&get("/"), Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(response.status().code(), 204);
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_close_interrupts_pending() {
        let addr = origin(1, b"").await;
        let conn = connection(addr);
        conn.connect().await.unwrap();
        let rx = conn.write(&get("/")).await.unwrap();
        conn.close().await;

        assert!(matches!(rx.await.unwrap(), Err(ProxyError::Interrupted(_))));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.write(&get("/")).await,
            Err(ProxyError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_close_response_closes() {
        let addr = origin(
            1,
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok",
        )
        .await;
        let conn = connection(addr);
        conn.connect().await.unwrap();
        let response = conn.send(&get("/"), None).await.unwrap();
        assert!(!response.keep_alive());
        assert!(!conn.is_usable());

        for _ in 0..50 {
            if conn.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_delimited_response_retires_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_requests(&mut stream, 1).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\nstreamed body")
                .await
                .unwrap();
        });

        let conn = connection(addr);
        conn.connect().await.unwrap();
        let response = conn.send(&get("/"), Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(response.body().unwrap().as_ref(), b"streamed body");
        assert!(!conn.is_usable());
    }

    #[tokio::test]
    async fn test_interim_responses_are_skipped() {
        let addr = origin(
            1,
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let conn = connection(addr);
        conn.connect().await.unwrap();
        let response = conn.send(&get("/"), None).await.unwrap();
        assert_eq!(response.status().code(), 201);
    }

    #[tokio::test]
    async fn test_head_response_has_no_body() {
        let addr = origin(
            2,
            b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody",
        )
        .await;
        let conn = connection(addr);
        conn.connect().await.unwrap();
        let head = HttpRequest::new(Method::Head, "/")
            .with_header("Host", "origin.test")
            .unwrap();
        let first = conn.write(&head).await.unwrap();
        let second = conn.write(&get("/")).await.unwrap();
        assert!(first.await.unwrap().unwrap().body().is_none());
        assert_eq!(second.await.unwrap().unwrap().body().unwrap().as_ref(), b"body");
    }

    #[tokio::test]
    async fn test_send_times_out() {
        let addr = origin(1, b"").await;
        let conn = connection(addr);
        conn.connect().await.unwrap();
        let result = conn.send(&get("/"), Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(ProxyError::Timeout(_))));
    }
}
