//! Proxy server: owns the listener and the accept loop

use crate::server::config::{Proxy, ProxyConfig, ProxyContext};
use crate::session::ClientSession;
use crate::util::{ProxyError, Result, bind_listener, configure_tcp_stream};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

/// Receives errors raised while accepting or serving clients
pub type ErrorHandler = Arc<dyn Fn(&ProxyError) + Send + Sync>;

struct Running {
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Forwarding HTTP/1.1 proxy
pub struct ProxyServer {
    context: Arc<ProxyContext>,
    listen: RwLock<SocketAddr>,
    clients: Arc<DashMap<u64, Arc<ClientSession>>>,
    running: Mutex<Option<Running>>,
    error_handler: Option<ErrorHandler>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let context = ProxyContext::new(&config)?;
        Ok(Self {
            context: Arc::new(context),
            listen: RwLock::new(config.listen),
            clients: Arc::new(DashMap::new()),
            running: Mutex::new(None),
            error_handler: None,
        })
    }

    /// Route accept and session errors to `handler` instead of the log
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ProxyError) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Listening address; once started on port 0 this is the bound port
    pub fn address(&self) -> SocketAddr {
        *self.listen.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn proxy(&self) -> Proxy {
        Proxy::http(self.address())
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Live client sessions
    pub fn clients(&self) -> Vec<Arc<ClientSession>> {
        self.clients
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.context
    }

    /// Allow or forbid sessions from opening connections to new destinations
    pub fn set_new_connections_allowed(&self, allowed: bool) {
        self.context.set_new_connections_allowed(allowed);
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind the listener and start accepting clients.
    ///
    /// Returns `Ok(false)` if the server is already running.
    pub async fn start(&self) -> Result<bool> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Ok(false);
        }

        let listener = bind_listener(self.address())?;
        let local = listener.local_addr()?;
        *self.listen.write().unwrap_or_else(|e| e.into_inner()) = local;

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&self.context),
            Arc::clone(&self.clients),
            cancel.clone(),
            self.error_handler.clone(),
        ));
        *running = Some(Running {
            cancel,
            accept_task,
        });

        tracing::info!("[Server] Listening on {}", local);
        Ok(true)
    }

    /// Stop accepting, close the listener and every live session.
    ///
    /// Returns false if the server was not running.
    pub async fn stop(&self) -> bool {
        let Some(running) = self.lock_running().take() else {
            return false;
        };
        running.cancel.cancel();
        if let Err(e) = running.accept_task.await {
            tracing::warn!("[Server] Accept task ended abnormally: {}", e);
        }

        let sessions = self.clients();
        self.clients.clear();
        let count = sessions.len();
        for session in sessions {
            session.close().await;
        }
        tracing::info!(
            "[Server] Stopped listening on {} ({} sessions closed)",
            self.address(),
            count
        );
        true
    }
}

fn report(handler: &Option<ErrorHandler>, error: &ProxyError) {
    match handler {
        Some(handler) => handler(error),
        None => tracing::error!("[Server] {}", error),
    }
}

async fn accept_loop(
    listener: TcpListener,
    context: Arc<ProxyContext>,
    clients: Arc<DashMap<u64, Arc<ClientSession>>>,
    cancel: CancellationToken,
    error_handler: Option<ErrorHandler>,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                report(&error_handler, &ProxyError::Io(e));
                continue;
            }
        };
        configure_tcp_stream(&stream, "client connection");

        let session = Arc::new(ClientSession::new(peer_addr, Arc::clone(&context), &cancel));
        let session_id = session.id();
        clients.insert(session_id, Arc::clone(&session));

        let span = info_span!(
            "relay.session",
            peer_addr = %peer_addr,
            session_id = session_id
        );
        let clients = Arc::clone(&clients);
        let error_handler = error_handler.clone();
        tokio::spawn(
            async move {
                tracing::info!("[Server] Session {} accepted from {}", session_id, peer_addr);
                let served = tokio::spawn(Arc::clone(&session).run(stream).in_current_span()).await;
                match served {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => report(&error_handler, &e),
                    Err(e) => {
                        session.close().await;
                        report(&error_handler, &ProxyError::Task(e));
                    }
                }
                clients.remove(&session_id);
            }
            .instrument(span),
        );
    }
    tracing::debug!("[Server] Accept loop finished");
}
