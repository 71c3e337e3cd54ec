/// Header keys, headers and the header registry
pub mod header;
/// Content-Type parsing
pub mod content_type;
/// Destination authority parsing
pub mod authority;
/// Status codes
pub mod status;
/// Requests and responses
pub mod message;
/// Message boundary detection
pub mod framing;
/// Wire codec and stream decoders
pub mod codec;
/// Protocol version registry
pub mod registry;

pub use authority::*;
pub use codec::*;
pub use content_type::*;
pub use header::{Header, HeaderKey, HeaderRegistry, Headers};
pub use message::*;
pub use registry::*;
pub use status::*;
