//! Connection metadata

use crate::{Error, Result};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "TCP"),
            Network::Udp => write!(f, "UDP"),
        }
    }
}

/// Routing information for one connection, as handed down by the rule engine
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Network type (TCP/UDP)
    pub network: Network,

    /// Source IP address
    pub src_ip: IpAddr,

    /// Source port
    pub src_port: u16,

    /// Destination IP address (may be unset if only host is known)
    pub dst_ip: Option<IpAddr>,

    /// Destination port
    pub dst_port: u16,

    /// Destination host (domain name)
    pub host: String,
}

impl Metadata {
    /// Create new metadata
    pub fn new(network: Network) -> Self {
        Metadata {
            network,
            src_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_ip: None,
            dst_port: 0,
            host: String::new(),
        }
    }

    /// Create TCP metadata
    pub fn tcp() -> Self {
        Self::new(Network::Tcp)
    }

    /// Create UDP metadata
    pub fn udp() -> Self {
        Self::new(Network::Udp)
    }

    /// Build TCP metadata from a `host:port` string (IPv6 hosts may be bracketed)
    pub fn from_addr(addr: &str) -> Result<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| Error::address(format!("missing port in {}", addr)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::address(format!("invalid port in {}", addr)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        let meta = Metadata::tcp().with_dst_port(port);
        Ok(match host.parse::<IpAddr>() {
            Ok(ip) => meta.with_dst_ip(ip),
            Err(_) => meta.with_host(host.to_string()),
        })
    }

    /// Set source address
    pub fn with_source(mut self, addr: SocketAddr) -> Self {
        self.src_ip = addr.ip();
        self.src_port = addr.port();
        self
    }

    /// Set destination IP
    pub fn with_dst_ip(mut self, ip: IpAddr) -> Self {
        self.dst_ip = Some(ip);
        self
    }

    /// Set destination port
    pub fn with_dst_port(mut self, port: u16) -> Self {
        self.dst_port = port;
        self
    }

    /// Set destination host
    pub fn with_host(mut self, host: String) -> Self {
        self.host = host;
        self
    }

    /// Get remote address string (for dialing)
    pub fn remote_address(&self) -> String {
        if !self.host.is_empty() {
            format!("{}:{}", self.host, self.dst_port)
        } else if let Some(ip) = self.dst_ip {
            SocketAddr::new(ip, self.dst_port).to_string()
        } else {
            format!("0.0.0.0:{}", self.dst_port)
        }
    }

    /// Check if metadata is valid
    pub fn valid(&self) -> bool {
        self.dst_port > 0 && (!self.host.is_empty() || self.dst_ip.is_some())
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}:{} --> {}",
            self.network,
            self.src_ip,
            self.src_port,
            self.remote_address()
        )
    }
}
