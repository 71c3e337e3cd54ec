//! One accepted client connection and the destination connections it uses

use crate::protocol::authority::UriAuthority;
use crate::protocol::codec::{HttpCodec, RequestDecoder};
use crate::protocol::header::{
    CONNECTION, CONTENT_LENGTH, FORWARDED, FROM, HOST, KEEP_ALIVE, PROXY_ANONYMOUS,
    PROXY_AUTHORIZATION, PROXY_CONNECTION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE, VIA,
    X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO, X_REAL_IP,
};
use crate::protocol::message::{HttpRequest, HttpResponse, Method};
use crate::protocol::status::HttpStatus;
use crate::server::ProxyContext;
use crate::session::outbound::OutboundConnection;
use crate::util::{ProxyError, Result};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub const VIA_VALUE: &str = "1.1 relay-proxy";

/// Destination connections are shared only between requests that agree on
/// anonymity, since the forwarded headers differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub addr: SocketAddr,
    pub anonymous: bool,
}

/// Response slot in arrival order, plus whether the client connection stays
/// open after it is written
type OrderedResponse = (oneshot::Receiver<HttpResponse>, bool);

pub struct ClientSession {
    id: u64,
    peer_addr: SocketAddr,
    context: Arc<ProxyContext>,
    authenticated: AtomicBool,
    keep_alive: AtomicBool,
    connections: DashMap<PoolKey, Arc<OutboundConnection>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl ClientSession {
    pub fn new(peer_addr: SocketAddr, context: Arc<ProxyContext>, parent: &CancellationToken) -> Self {
        let authenticated = context.authenticator().is_none();
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            context,
            authenticated: AtomicBool::new(authenticated),
            keep_alive: AtomicBool::new(true),
            connections: DashMap::new(),
            cancel: parent.child_token(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Relaxed)
    }

    /// Keep-alive wish of the most recent request
    pub fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Number of pooled destination connections
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Serve the client until it disconnects, asks to close, or the session is cancelled.
    ///
    /// Socket read failures are returned once the session has shut down.
    pub async fn run(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let codec = self.context.protocols().default_codec()?;
        let (read_half, write_half) = stream.into_split();
        let mut requests = FramedRead::new(
            read_half,
            RequestDecoder::new(Arc::clone(self.context.protocols())),
        );

        let (order_tx, order_rx) = mpsc::unbounded_channel::<OrderedResponse>();
        let writer = tokio::spawn(
            Arc::clone(&self)
                .write_loop(write_half, order_rx, codec)
                .in_current_span(),
        );

        let mut count = 0u64;
        let mut failure = None;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = requests.next() => next,
            };

            let mut request = match next {
                None => {
                    tracing::debug!("[Session] Client {} closed the connection", self.peer_addr);
                    break;
                }
                Some(Err(e @ ProxyError::Io(_))) => {
                    tracing::debug!("[Session] Read from {} failed: {}", self.peer_addr, e);
                    failure = Some(e);
                    break;
                }
                Some(Err(e)) => {
                    tracing::debug!("[Session] Unreadable request from {}: {}", self.peer_addr, e);
                    let (tx, rx) = oneshot::channel();
                    let _ = tx.send(HttpResponse::error(HttpStatus::BAD_REQUEST, &e.to_string()));
                    let _ = order_tx.send((rx, false));
                    break;
                }
                Some(Ok(request)) => request,
            };

            count += 1;
            let keep_alive = request.keep_alive();
            self.keep_alive.store(keep_alive, Ordering::Relaxed);
            request.headers_mut().remove(PROXY_CONNECTION);
            tracing::debug!(
                "[Session] Request #{}: {} {} (keep_alive={})",
                count,
                request.method(),
                request.path(),
                keep_alive
            );

            let (tx, rx) = oneshot::channel();
            if order_tx.send((rx, keep_alive)).is_err() {
                break;
            }
            let session = Arc::clone(&self);
            tokio::spawn(
                async move {
                    let response = session.request(request).await;
                    let _ = tx.send(response);
                }
                .in_current_span(),
            );

            if !keep_alive {
                break;
            }
        }

        drop(order_tx);
        let _ = writer.await;
        self.close().await;
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut order_rx: mpsc::UnboundedReceiver<OrderedResponse>,
        codec: Arc<dyn HttpCodec>,
    ) {
        while let Some((slot, keep_alive)) = order_rx.recv().await {
            let response = tokio::select! {
                _ = self.cancel.cancelled() => break,
                response = slot => response.unwrap_or_else(|_| {
                    HttpResponse::error(HttpStatus::BAD_REQUEST, "Request was abandoned")
                }),
            };
            let mut response = response;
            if !keep_alive {
                response.headers_mut().replace(CONNECTION, "close");
            }

            let bytes = match codec.serialize_response(&response) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!("[Session] Cannot relay {} response: {}", response.status(), e);
                    let fallback = HttpResponse::error(HttpStatus::BAD_REQUEST, &e.to_string());
                    match codec.serialize_response(&fallback) {
                        Ok(bytes) => bytes,
                        Err(_) => continue,
                    }
                }
            };

            if let Err(e) = writer.write_all(&bytes).await {
                tracing::debug!("[Session] Write to {} failed: {}", self.peer_addr, e);
                break;
            }
            if !keep_alive {
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    /// Route one request to its destination. Failures become a 400 response.
    pub async fn request(&self, request: HttpRequest) -> HttpResponse {
        match self.route(request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!("[Session] Request failed: {}", e);
                HttpResponse::error(HttpStatus::BAD_REQUEST, &e.to_string())
            }
        }
    }

    async fn route(&self, request: HttpRequest) -> Result<HttpResponse> {
        if self.is_closed() {
            return Err(ProxyError::SessionClosed);
        }

        let mut outbound = request.without_authority();
        if !outbound.headers().contains(HOST)
            && let Some(authority) = request.authority()
        {
            outbound.headers_mut().insert(HOST, authority.host_header())?;
        }
        let anonymous = outbound
            .headers_mut()
            .remove(PROXY_ANONYMOUS)
            .iter()
            .any(|h| h.value().eq_ignore_ascii_case("true"));

        if let Some(authenticator) = self.context.authenticator()
            && !self.is_authenticated()
        {
            if let Some(rejection) = authenticator.validate(&mut outbound) {
                tracing::debug!(
                    "[Session] Session {} rejected with {}",
                    self.id,
                    rejection.status()
                );
                return Ok(rejection);
            }
            self.authenticated.store(true, Ordering::Relaxed);
            tracing::debug!("[Session] Session {} authenticated", self.id);
        }

        if outbound.method() == Method::Connect {
            return Err(ProxyError::Protocol("CONNECT tunnelling is not supported".into()));
        }

        let host = outbound
            .host()
            .ok_or_else(|| ProxyError::Parse("missing Host header".into()))?;
        let destination = UriAuthority::parse(host)?;
        let addr = self
            .context
            .resolver()
            .resolve(destination.hostname(), destination.port())
            .await?;

        self.prepare_forwarding(&mut outbound, anonymous)?;

        let keep_alive = outbound.connection_keep_alive();
        let connection = self.connection_for(PoolKey { addr, anonymous }, keep_alive)?;
        let sent = connection
            .send(&outbound, self.context.request_timeout())
            .await;
        if !connection.keep_alive() {
            connection.close().await;
        }

        let mut response = sent?;
        prepare_relay(&mut response, outbound.method() == Method::Head);
        tracing::debug!(
            "[Session] {} {} -> {} {}",
            outbound.method(),
            outbound.path(),
            addr,
            response.status()
        );
        Ok(response)
    }

    fn prepare_forwarding(&self, request: &mut HttpRequest, anonymous: bool) -> Result<()> {
        let headers = request.headers_mut();
        for hop in [PROXY_CONNECTION, PROXY_AUTHORIZATION, KEEP_ALIVE, TE, TRAILER, UPGRADE] {
            headers.remove(hop);
        }

        if anonymous {
            for identifying in [
                VIA,
                FORWARDED,
                X_FORWARDED_FOR,
                X_FORWARDED_HOST,
                X_FORWARDED_PROTO,
                X_REAL_IP,
                FROM,
            ] {
                headers.remove(identifying);
            }
            return Ok(());
        }

        headers.insert(VIA, VIA_VALUE)?;
        let client_ip = self.peer_addr.ip().to_string();
        let chain: Vec<String> = headers
            .remove(X_FORWARDED_FOR)
            .into_iter()
            .map(|h| h.value().to_string())
            .chain(std::iter::once(client_ip))
            .collect();
        headers.insert(X_FORWARDED_FOR, chain.join(", "))
    }

    /// Pooled connection for `key`, or a new one when allowed.
    ///
    /// Only keep-alive connections enter the pool; closed ones are replaced here.
    fn connection_for(&self, key: PoolKey, keep_alive: bool) -> Result<Arc<OutboundConnection>> {
        let allowed = self.context.new_connections_allowed();
        let open = || {
            Arc::new(
                OutboundConnection::new(key.addr, Arc::clone(self.context.protocols()))
                    .with_keep_alive(keep_alive)
                    .with_lazy_connect(true)
                    .with_connect_timeout(self.context.connect_timeout())
                    .with_parent_token(&self.cancel),
            )
        };

        match self.connections.entry(key) {
            Entry::Occupied(entry) if entry.get().is_usable() => Ok(Arc::clone(entry.get())),
            Entry::Occupied(mut entry) => {
                if !allowed || !keep_alive {
                    entry.remove();
                    return if allowed {
                        Ok(open())
                    } else {
                        Err(ProxyError::NewConnectionsDisabled)
                    };
                }
                let connection = open();
                entry.insert(Arc::clone(&connection));
                Ok(connection)
            }
            Entry::Vacant(entry) => {
                if !allowed {
                    return Err(ProxyError::NewConnectionsDisabled);
                }
                let connection = open();
                if keep_alive {
                    entry.insert(Arc::clone(&connection));
                    tracing::debug!(
                        "[Session] Session {} pooled connection {} to {}",
                        self.id,
                        connection.id(),
                        key.addr
                    );
                }
                Ok(connection)
            }
        }
    }

    /// Close every destination connection and stop the session's tasks
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        self.cancel.cancel();
        let connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.connections.clear();
        for connection in connections {
            connection.close().await;
        }
        tracing::info!("[Session] Session {} from {} closed", self.id, self.peer_addr);
    }
}

/// Drop the destination's hop-by-hop headers and give bodies framed by
/// connection close an explicit length, since the client connection may stay open.
fn prepare_relay(response: &mut HttpResponse, head_request: bool) {
    let upgrade = response.status().code() == 101;
    let bodyless = head_request || response.status().is_bodyless();
    let length = response.body().map_or(0, |body| body.len());

    let headers = response.headers_mut();
    for hop in [KEEP_ALIVE, PROXY_CONNECTION] {
        headers.remove(hop);
    }
    if !upgrade {
        headers.remove(CONNECTION);
        headers.remove(UPGRADE);
    }
    if !bodyless
        && !headers.contains(CONTENT_LENGTH)
        && !headers.has_token(TRANSFER_ENCODING, "chunked")
    {
        headers.append(CONTENT_LENGTH, length.to_string());
    }
}
