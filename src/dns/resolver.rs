//! DNS resolver implementation

use super::DnsCache;
use crate::config::DnsConfig;
use crate::{Error, Result};
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

/// DNS resolver with hosts overrides and an LRU cache
pub struct Resolver {
    resolver: TokioAsyncResolver,
    cache: DnsCache,
    hosts: HashMap<String, IpAddr>,
    ipv6: bool,
}

impl Resolver {
    pub fn new(config: &DnsConfig) -> Result<Self> {
        let mut hosts = HashMap::new();
        for (domain, ip_str) in &config.hosts {
            match ip_str.parse() {
                Ok(ip) => {
                    hosts.insert(domain.clone(), ip);
                }
                Err(_) => debug!("ignoring hosts entry {} -> {}", domain, ip_str),
            }
        }

        Ok(Resolver {
            resolver: Self::build_resolver(&config.nameserver)?,
            cache: DnsCache::new(config.cache_size),
            hosts,
            ipv6: config.ipv6,
        })
    }

    fn build_resolver(nameservers: &[String]) -> Result<TokioAsyncResolver> {
        if nameservers.is_empty() {
            return TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| Error::dns(format!("Failed to create system resolver: {}", e)));
        }

        let mut config = ResolverConfig::new();
        for ns in nameservers {
            let addr = Self::parse_nameserver(ns)
                .ok_or_else(|| Error::config(format!("invalid nameserver: {}", ns)))?;
            for protocol in [Protocol::Udp, Protocol::Tcp] {
                config.add_name_server(NameServerConfig {
                    socket_addr: addr,
                    protocol,
                    tls_dns_name: None,
                    trust_negative_responses: true,
                    bind_addr: None,
                });
            }
        }

        let mut opts = ResolverOpts::default();
        opts.cache_size = 0; // We use our own cache
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;

        Ok(TokioAsyncResolver::tokio(config, opts))
    }

    /// `8.8.8.8`, `8.8.8.8:53`, `udp://8.8.8.8`, `[2001:4860::8888]:53`
    fn parse_nameserver(ns: &str) -> Option<SocketAddr> {
        let ns = ns
            .strip_prefix("udp://")
            .or_else(|| ns.strip_prefix("tcp://"))
            .unwrap_or(ns);

        if let Ok(addr) = ns.parse::<SocketAddr>() {
            return Some(addr);
        }
        ns.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 53))
    }

    /// Resolve domain to all IPs
    pub async fn resolve_all(&self, domain: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if let Some(ip) = self.hosts.get(domain) {
            return Ok(vec![*ip]);
        }
        if let Some(ips) = self.cache.get(domain) {
            return Ok(ips);
        }

        let ips = self.lookup(domain).await?;
        if ips.is_empty() {
            return Err(Error::dns(format!("No IP found for {}", domain)));
        }
        self.cache.put(domain.to_string(), ips.clone());
        debug!("DNS {} -> {:?}", domain, ips);
        Ok(ips)
    }

    async fn lookup(&self, domain: &str) -> Result<Vec<IpAddr>> {
        let mut ips = Vec::new();

        match self.resolver.ipv4_lookup(domain).await {
            Ok(response) => ips.extend(response.iter().map(|a| IpAddr::V4(a.0))),
            Err(e) => debug!("IPv4 lookup failed for {}: {}", domain, e),
        }

        if self.ipv6 {
            match self.resolver.ipv6_lookup(domain).await {
                Ok(response) => ips.extend(response.iter().map(|a| IpAddr::V6(a.0))),
                Err(e) => debug!("IPv6 lookup failed for {}: {}", domain, e),
            }
        }

        Ok(ips)
    }
}
