//! Forwarding HTTP/1.1 proxy
//!
//! Accepts plain HTTP/1.1 requests, optionally authenticates them, and
//! relays each one to its destination over a pooled keep-alive connection.
//!
//! # Architecture
//!
//! - **protocol**: Headers, authorities, messages and the HTTP/1.1 codec
//! - **session**: Client sessions and destination connections
//! - **server**: Listener, accept loop and configuration
//! - **util**: Errors, authentication, DNS resolution and socket tuning

/// Protocol layer: message model and wire codec
pub mod protocol;
/// Session layer: client sessions and destination connections
pub mod session;
/// Utility modules (error, auth, DNS, sockets)
pub mod util;
/// Server implementation
pub mod server;

pub use protocol::*;
pub use server::*;
pub use session::*;
pub use util::*;

// Re-export commonly used types
pub use util::error::{ProxyError, Result};
