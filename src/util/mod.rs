/// Error types and Result alias
pub mod error;
/// Proxy authentication gate
pub mod auth;
pub mod net;
/// Destination DNS resolution
pub mod resolver;

pub use auth::*;
pub use error::*;
pub use net::*;
pub use resolver::*;
