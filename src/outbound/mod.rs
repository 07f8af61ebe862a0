//! Outbound adapters
//!
//! The capability contract every egress satisfies (`OutboundProxy`), the
//! runtime handle that adds liveness and delay telemetry on top (`Proxy`),
//! chain-tracking connections, and the dialer decorators used to build
//! multi-hop chains. Concrete protocols kept here are Direct, Reject, SOCKS5
//! and HTTP CONNECT; everything else parses into a `ProxyType` and is then
//! rejected as unsupported.

mod dialer;
mod direct;
mod http;
mod proxy;
mod reject;
mod socks5;

pub use dialer::{Dialer, DirectDialer, ProxyDialer};
pub use direct::Direct;
pub use http::HttpProxy;
pub use proxy::{AnyProxy, DelayHistory, Proxy, DEFAULT_URL_TEST_TIMEOUT, MAX_DELAY_HISTORY};
pub use reject::Reject;
pub use socks5::Socks5Proxy;

use crate::common::Metadata;
use crate::config::ProxyConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Proxy type enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyType {
    Direct,
    Reject,
    RejectDrop,
    Compatible,
    Shadowsocks,
    Vmess,
    Trojan,
    Hysteria2,
    Http,
    Socks5,
    Vless,
    Relay,
    Selector,
    Fallback,
    URLTest,
    LoadBalance,
    Http2Ping,
}

impl ProxyType {
    pub fn is_group(&self) -> bool {
        matches!(
            self,
            ProxyType::Relay
                | ProxyType::Selector
                | ProxyType::Fallback
                | ProxyType::URLTest
                | ProxyType::LoadBalance
                | ProxyType::Http2Ping
        )
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProxyType::Direct => "Direct",
            ProxyType::Reject => "Reject",
            ProxyType::RejectDrop => "RejectDrop",
            ProxyType::Compatible => "Compatible",
            ProxyType::Shadowsocks => "Shadowsocks",
            ProxyType::Vmess => "Vmess",
            ProxyType::Trojan => "Trojan",
            ProxyType::Hysteria2 => "Hysteria2",
            ProxyType::Http => "Http",
            ProxyType::Socks5 => "Socks5",
            ProxyType::Vless => "Vless",
            ProxyType::Relay => "Relay",
            ProxyType::Selector => "Selector",
            ProxyType::Fallback => "Fallback",
            ProxyType::URLTest => "URLTest",
            ProxyType::LoadBalance => "LoadBalance",
            ProxyType::Http2Ping => "Http2Ping",
        };
        f.write_str(s)
    }
}

impl TryFrom<&str> for ProxyType {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(ProxyType::Direct),
            "reject" => Ok(ProxyType::Reject),
            "reject-drop" => Ok(ProxyType::RejectDrop),
            "ss" | "shadowsocks" => Ok(ProxyType::Shadowsocks),
            "vmess" => Ok(ProxyType::Vmess),
            "trojan" => Ok(ProxyType::Trojan),
            "hysteria2" | "hy2" => Ok(ProxyType::Hysteria2),
            "http" => Ok(ProxyType::Http),
            "socks5" | "socks" => Ok(ProxyType::Socks5),
            "vless" => Ok(ProxyType::Vless),
            _ => Err(Error::config(format!("Unknown proxy type: {}", s))),
        }
    }
}

/// Capability contract shared by protocol adapters and proxy groups
#[async_trait]
pub trait OutboundProxy: Send + Sync {
    fn name(&self) -> &str;

    fn proxy_type(&self) -> ProxyType;

    /// `server:port` of the upstream, empty for Direct/Reject and groups
    fn addr(&self) -> String {
        String::new()
    }

    fn support_udp(&self) -> bool;

    /// Whether UDP can be carried over this hop's TCP stream
    fn support_uot(&self) -> bool {
        false
    }

    /// Whether this hop can open its upstream connection through another dialer
    fn support_with_dialer(&self) -> bool {
        false
    }

    /// Dial `metadata` opening the upstream connection through `dialer`
    async fn dial_tcp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedStream>;

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<ChainedStream> {
        self.dial_tcp_with_dialer(Arc::new(DirectDialer), metadata)
            .await
    }

    /// Open a UDP association whose packets leave through `dialer`
    async fn listen_udp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedDatagram> {
        let _ = (dialer, metadata);
        Err(Error::unsupported(format!("{} does not support UDP", self.name())))
    }

    async fn listen_udp(&self, metadata: &Metadata) -> Result<ChainedDatagram> {
        self.listen_udp_with_dialer(Arc::new(DirectDialer), metadata)
            .await
    }

    /// The next proxy a group would use for `metadata`; `None` for concrete adapters
    fn unwrap(&self, metadata: &Metadata, touch: bool) -> Option<AnyProxy> {
        let _ = (metadata, touch);
        None
    }

    /// Close the proxy (cleanup resources)
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Trait for proxy connections
pub trait ProxyConnection: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> ProxyConnection for T {}

/// A TCP connection that records which proxies it passed through
pub struct ChainedStream {
    inner: Box<dyn ProxyConnection>,
    chains: Vec<String>,
}

impl ChainedStream {
    pub fn new(inner: Box<dyn ProxyConnection>) -> Self {
        ChainedStream {
            inner,
            chains: Vec::new(),
        }
    }

    /// Innermost proxy first
    pub fn chains(&self) -> &[String] {
        &self.chains
    }

    pub fn append_to_chains(&mut self, name: &str) {
        self.chains.push(name.to_string());
    }
}

impl fmt::Debug for ChainedStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedStream")
            .field("chains", &self.chains)
            .finish()
    }
}

impl AsyncRead for ChainedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChainedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Packet-oriented side of an outbound
#[async_trait]
pub trait OutboundDatagram: Send + Sync {
    /// Send one datagram to `target` (`host:port`)
    async fn send_to(&self, buf: &[u8], target: &str) -> Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
}

/// A UDP association that records which proxies it passed through
pub struct ChainedDatagram {
    inner: Box<dyn OutboundDatagram>,
    chains: Vec<String>,
}

impl ChainedDatagram {
    pub fn new(inner: Box<dyn OutboundDatagram>) -> Self {
        ChainedDatagram {
            inner,
            chains: Vec::new(),
        }
    }

    pub fn chains(&self) -> &[String] {
        &self.chains
    }

    pub fn append_to_chains(&mut self, name: &str) {
        self.chains.push(name.to_string());
    }

    pub async fn send_to(&self, buf: &[u8], target: &str) -> Result<usize> {
        self.inner.send_to(buf, target).await
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }
}

#[async_trait]
impl OutboundDatagram for ChainedDatagram {
    async fn send_to(&self, buf: &[u8], target: &str) -> Result<usize> {
        self.inner.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }
}

/// Build a concrete adapter from its configuration entry
pub fn build_adapter(config: &ProxyConfig) -> Result<Arc<dyn OutboundProxy>> {
    let proxy_type = ProxyType::try_from(config.proxy_type.as_str())?;

    match proxy_type {
        ProxyType::Http => {
            let username = config.get_string("username");
            let password = config.get_string("password");
            let tls = config.get_bool("tls").unwrap_or(false);
            let skip_cert_verify = config.get_bool("skip-cert-verify").unwrap_or(false);

            Ok(Arc::new(HttpProxy::new(
                config.name.clone(),
                config.server.clone(),
                config.port,
                username,
                password,
                tls,
                skip_cert_verify,
            )))
        }
        ProxyType::Socks5 => {
            let username = config.get_string("username");
            let password = config.get_string("password");
            let udp = config.get_bool("udp").unwrap_or(false);

            Ok(Arc::new(Socks5Proxy::new(
                config.name.clone(),
                config.server.clone(),
                config.port,
                username,
                password,
                udp,
            )))
        }
        ProxyType::Direct => Ok(Arc::new(Direct::with_name(config.name.clone()))),
        ProxyType::Reject => Ok(Arc::new(Reject::with_name(config.name.clone(), false))),
        ProxyType::RejectDrop => Ok(Arc::new(Reject::with_name(config.name.clone(), true))),
        other => Err(Error::unsupported(format!(
            "proxy {}: protocol {} is not available in this build",
            config.name, other
        ))),
    }
}
