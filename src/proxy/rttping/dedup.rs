//! Endpoint keys for pinger deduplication
//!
//! Subscriptions often list several domains that resolve to the same
//! server. Keying pingers by the resolved `ip:port` set probes each physical
//! endpoint once.

use crate::dns::DnsResolve;
use crate::{Error, Result};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

const RESOLVE_TTL: Duration = Duration::from_secs(60);

type Promise = Shared<BoxFuture<'static, std::result::Result<Vec<IpAddr>, String>>>;

pub struct EndpointResolver {
    resolver: Arc<dyn DnsResolve>,
    domain_port: Regex,
    // domain -> in-flight or settled lookup, errors included
    promises: Mutex<HashMap<String, (Instant, Promise)>>,
}

impl EndpointResolver {
    pub fn new(resolver: Arc<dyn DnsResolve>) -> Result<Self> {
        Ok(EndpointResolver {
            resolver,
            domain_port: Regex::new(r"^(.+):(\d+)$")?,
            promises: Mutex::new(HashMap::new()),
        })
    }

    /// `host:port` to `ip1:port,ip2:port,...`
    pub async fn endpoint_key(&self, addr: &str) -> Result<String> {
        let caps = self
            .domain_port
            .captures(addr)
            .ok_or_else(|| Error::address(format!("invalid server domain: {}", addr)))?;
        let domain = &caps[1];
        let port: u16 = caps[2]
            .parse()
            .map_err(|_| Error::address(format!("invalid server port: {}", addr)))?;

        let mut ips = self.resolve(domain).await?;
        ips.sort();
        ips.dedup();
        Ok(ips
            .iter()
            .map(|ip| SocketAddr::new(*ip, port).to_string())
            .collect::<Vec<_>>()
            .join(","))
    }

    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let literal = domain.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let promise = {
            let mut promises = self.promises.lock();
            promises.retain(|_, (at, _)| at.elapsed() < RESOLVE_TTL);
            match promises.get(domain) {
                Some((_, promise)) => promise.clone(),
                None => {
                    let resolver = self.resolver.clone();
                    let name = domain.to_string();
                    let promise = async move {
                        resolver.resolve_all(&name).await.map_err(|e| e.to_string())
                    }
                    .boxed()
                    .shared();
                    promises.insert(domain.to_string(), (Instant::now(), promise.clone()));
                    promise
                }
            }
        };

        promise
            .await
            .map_err(|e| Error::dns(format!("lookup ip error: {}", e)))
    }
}
