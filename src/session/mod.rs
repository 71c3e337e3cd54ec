/// Client-facing sessions and destination pooling
pub mod client;
/// Destination connections with FIFO response matching
pub mod outbound;

pub use client::{ClientSession, PoolKey};
pub use outbound::{ConnectionState, OutboundConnection, ResponseReceiver};
