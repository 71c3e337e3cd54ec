use thiserror::Error;

/// Proxy errors
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid authority: {0}")]
    Authority(String),

    #[error("Invalid content type: {0}")]
    ContentType(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Connection to {0} is already established")]
    AlreadyConnected(std::net::SocketAddr),

    #[error("Connection to {0} is not established")]
    NotConnected(std::net::SocketAddr),

    #[error("Request interrupted: {0}")]
    Interrupted(String),

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Session closed")]
    SessionClosed,

    #[error("Opening new connections is disabled")]
    NewConnectionsDisabled,

    #[error("DNS resolution failed: {0}")]
    Resolve(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ProxyError {
    /// Whether the error was raised while reading or writing a socket
    pub fn is_io(&self) -> bool {
        matches!(self, ProxyError::Io(_) | ProxyError::Interrupted(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, ProxyError>;
