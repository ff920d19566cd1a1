//! Network module - Per-request connections to Gemini, Gopher and Finger hosts
//!
//! Provides:
//! - Buffered non-blocking streams over plain TCP or TLS
//! - Pluggable name resolution
//! - The per-request state machine
//! - The dispatcher routing channel messages to live requests

mod dispatcher;
mod request;
mod resolver;
mod stream;
mod tls;

pub use dispatcher::*;
pub use request::*;
pub use resolver::*;
pub use stream::*;
pub use tls::*;

use std::sync::Arc;

use crate::config::NetworkConfig;

impl RequestContext {
    /// Build the shared request services from configuration
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self {
            resolver: resolver_for(config.resolver),
            handshaker: Arc::new(NativeTlsHandshaker),
            handshake_timeout: config.handshake_timeout(),
            connect_timeout: config.connect_timeout(),
            chunk_size: config.chunk_size(),
        }
    }
}
