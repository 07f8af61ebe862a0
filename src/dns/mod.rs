//! DNS resolution consumed by the ping group's endpoint deduplication

mod cache;
mod resolver;

pub use cache::DnsCache;
pub use resolver::Resolver;

use crate::Result;
use async_trait::async_trait;
use std::net::IpAddr;

/// Anything that can turn a domain into its addresses
#[async_trait]
pub trait DnsResolve: Send + Sync {
    async fn resolve_all(&self, domain: &str) -> Result<Vec<IpAddr>>;
}

#[async_trait]
impl DnsResolve for Resolver {
    async fn resolve_all(&self, domain: &str) -> Result<Vec<IpAddr>> {
        Resolver::resolve_all(self, domain).await
    }
}
