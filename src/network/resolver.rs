//! Host name resolution
//!
//! Requests only see the [`Resolver`] trait: resolution may suspend and
//! eventually yields candidate addresses or an error.

use async_trait::async_trait;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use thiserror::Error;

use crate::config::ResolverKind;

/// Resolution errors
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("can't resolve {host}: {source}")]
    Lookup {
        host: String,
        #[source]
        source: std::io::Error,
    },

    #[error("can't resolve {host}: no usable address")]
    NoAddresses { host: String },
}

pub type ResolveResult<T> = Result<T, ResolveError>;

/// Turns a host and port into an ordered list of candidate endpoints
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> ResolveResult<Vec<SocketAddr>>;
}

/// Resolver driven by the runtime; other requests keep running meanwhile
#[derive(Debug, Default, Clone, Copy)]
pub struct AsyncResolver;

#[async_trait]
impl Resolver for AsyncResolver {
    async fn resolve(&self, host: &str, port: u16) -> ResolveResult<Vec<SocketAddr>> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|source| ResolveError::Lookup {
                host: host.to_string(),
                source,
            })?;
        non_empty(host, addrs.collect())
    }
}

/// Plain blocking lookup; stalls the event loop for its duration
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockingResolver;

#[async_trait]
impl Resolver for BlockingResolver {
    async fn resolve(&self, host: &str, port: u16) -> ResolveResult<Vec<SocketAddr>> {
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|source| ResolveError::Lookup {
                host: host.to_string(),
                source,
            })?;
        non_empty(host, addrs.collect())
    }
}

fn non_empty(host: &str, addrs: Vec<SocketAddr>) -> ResolveResult<Vec<SocketAddr>> {
    if addrs.is_empty() {
        return Err(ResolveError::NoAddresses {
            host: host.to_string(),
        });
    }
    tracing::debug!("Resolved {} to {} candidate(s)", host, addrs.len());
    Ok(addrs)
}

/// Build the resolver selected by configuration
pub fn resolver_for(kind: ResolverKind) -> Arc<dyn Resolver> {
    match kind {
        ResolverKind::Async => Arc::new(AsyncResolver),
        ResolverKind::Blocking => Arc::new(BlockingResolver),
    }
}
