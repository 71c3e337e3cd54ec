//! Proxy server and its configuration

pub mod config;
#[allow(clippy::module_inception)]
pub mod server;

pub use config::*;
pub use server::*;
