//! Dialers: how a hop opens its upstream connection

use super::{AnyProxy, OutboundDatagram, ProxyConnection};
use crate::common::net::connect_tcp;
use crate::common::Metadata;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::debug;

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a stream to `addr` (`host:port`)
    async fn dial_tcp(&self, addr: &str) -> Result<Box<dyn ProxyConnection>>;

    /// Open a packet path able to reach `metadata`'s destination
    async fn listen_udp(&self, metadata: &Metadata) -> Result<Box<dyn OutboundDatagram>>;
}

/// Plain TCP and UDP from this host
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial_tcp(&self, addr: &str) -> Result<Box<dyn ProxyConnection>> {
        Ok(Box::new(connect_tcp(addr).await?))
    }

    async fn listen_udp(&self, metadata: &Metadata) -> Result<Box<dyn OutboundDatagram>> {
        let bind = match metadata.dst_ip {
            Some(ip) if ip.is_ipv6() => "[::]:0",
            _ => "0.0.0.0:0",
        };
        let socket = UdpSocket::bind(bind).await?;
        Ok(Box::new(DirectDatagram { socket }))
    }
}

struct DirectDatagram {
    socket: UdpSocket,
}

#[async_trait]
impl OutboundDatagram for DirectDatagram {
    async fn send_to(&self, buf: &[u8], target: &str) -> Result<usize> {
        self.socket
            .send_to(buf, target)
            .await
            .map_err(|e| Error::connection(format!("udp send to {}: {}", target, e)))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf).await?)
    }
}

/// Reaches `addr` by tunnelling through `proxy`, which itself dials via `inner`
pub struct ProxyDialer {
    proxy: AnyProxy,
    inner: Arc<dyn Dialer>,
}

impl ProxyDialer {
    pub fn new(proxy: AnyProxy, inner: Arc<dyn Dialer>) -> Self {
        ProxyDialer { proxy, inner }
    }
}

#[async_trait]
impl Dialer for ProxyDialer {
    async fn dial_tcp(&self, addr: &str) -> Result<Box<dyn ProxyConnection>> {
        let metadata = Metadata::from_addr(addr)?;
        debug!("dialing {} via {}", addr, self.proxy.name());
        let stream = self
            .proxy
            .dial_tcp_with_dialer(self.inner.clone(), &metadata)
            .await?;
        Ok(Box::new(stream))
    }

    async fn listen_udp(&self, metadata: &Metadata) -> Result<Box<dyn OutboundDatagram>> {
        debug!(
            "opening udp to {} via {}",
            metadata.remote_address(),
            self.proxy.name()
        );
        let pc = self
            .proxy
            .listen_udp_with_dialer(self.inner.clone(), metadata)
            .await?;
        Ok(Box::new(pc))
    }
}
