//! SOCKS5 proxy outbound
//!
//! TCP via CONNECT; UDP via UDP ASSOCIATE with the control connection held
//! open for the lifetime of the association.

use super::{
    ChainedDatagram, ChainedStream, Dialer, OutboundDatagram, OutboundProxy, ProxyConnection,
    ProxyType,
};
use crate::common::socks::{self, Address, UdpHeader, CMD_CONNECT, CMD_UDP_ASSOCIATE};
use crate::common::{Metadata, Network};
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// SOCKS5 proxy outbound
pub struct Socks5Proxy {
    name: String,
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    udp: bool,
}

impl Socks5Proxy {
    pub fn new(
        name: String,
        server: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        udp: bool,
    ) -> Self {
        Socks5Proxy {
            name,
            server,
            port,
            username,
            password,
            udp,
        }
    }

    fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    fn target(metadata: &Metadata) -> Result<Address> {
        if !metadata.host.is_empty() {
            Ok(Address::from(metadata.host.as_str()))
        } else if let Some(ip) = metadata.dst_ip {
            Ok(Address::from(ip))
        } else {
            Err(Error::connection("No destination address"))
        }
    }
}

#[async_trait]
impl OutboundProxy for Socks5Proxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Socks5
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    fn support_udp(&self) -> bool {
        self.udp
    }

    fn support_with_dialer(&self) -> bool {
        true
    }

    async fn dial_tcp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedStream> {
        let target = Self::target(metadata)?;
        debug!(
            "[{}] SOCKS5 connecting to {} via {}",
            self.name,
            metadata.remote_address(),
            self.addr()
        );

        let mut stream = dialer.dial_tcp(&self.addr()).await?;
        socks::client_handshake(
            &mut stream,
            CMD_CONNECT,
            &target,
            metadata.dst_port,
            self.credentials(),
        )
        .await?;

        Ok(ChainedStream::new(stream))
    }

    async fn listen_udp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        _metadata: &Metadata,
    ) -> Result<ChainedDatagram> {
        if !self.udp {
            return Err(Error::unsupported(format!("{} has udp disabled", self.name)));
        }

        let mut control = dialer.dial_tcp(&self.addr()).await?;
        let (bound, port) = socks::client_handshake(
            &mut control,
            CMD_UDP_ASSOCIATE,
            &Address::Ipv4(std::net::Ipv4Addr::UNSPECIFIED),
            0,
            self.credentials(),
        )
        .await?;

        // servers commonly answer 0.0.0.0; fall back to the server address then
        let relay = match bound.to_ip() {
            Some(ip) if !ip.is_unspecified() => SocketAddr::new(ip, port).to_string(),
            _ => match self.server.parse::<IpAddr>() {
                Ok(ip) => SocketAddr::new(ip, port).to_string(),
                Err(_) => format!("{}:{}", self.server, port),
            },
        };
        let mut relay_metadata = Metadata::from_addr(&relay)?;
        relay_metadata.network = Network::Udp;

        let packets = dialer.listen_udp(&relay_metadata).await?;
        debug!("[{}] UDP associate relay at {}", self.name, relay);

        Ok(ChainedDatagram::new(Box::new(Socks5Datagram {
            packets,
            relay,
            _control: control,
        })))
    }
}

struct Socks5Datagram {
    packets: Box<dyn OutboundDatagram>,
    relay: String,
    _control: Box<dyn ProxyConnection>,
}

#[async_trait]
impl OutboundDatagram for Socks5Datagram {
    async fn send_to(&self, buf: &[u8], target: &str) -> Result<usize> {
        let metadata = Metadata::from_addr(target)?;
        let header = UdpHeader {
            frag: 0,
            address: Socks5Proxy::target(&metadata)?,
            port: metadata.dst_port,
        };
        let mut packet = Vec::with_capacity(buf.len() + 32);
        header.encode(&mut packet)?;
        packet.extend_from_slice(buf);
        self.packets.send_to(&packet, &self.relay).await?;
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let mut packet = vec![0u8; buf.len() + 262];
        let (n, _) = self.packets.recv_from(&mut packet).await?;
        let (header, offset) = UdpHeader::from_bytes(&packet[..n])?;
        let from = header
            .socket_addr()
            .ok_or_else(|| Error::protocol("relay returned a domain source address"))?;
        let payload = &packet[offset..n];
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok((len, from))
    }
}
