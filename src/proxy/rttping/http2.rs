//! HTTP/2 session used for PING round trips through a proxy

use crate::common::{tls, Metadata};
use crate::outbound::AnyProxy;
use crate::{Error, Result};
use bytes::Bytes;
use h2::client::SendRequest;
use h2::{Ping, PingPong};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::debug;
use url::Url;

/// One TLS + HTTP/2 connection to the ping server, tunnelled through a proxy
pub struct Http2Session {
    // keeps the connection open; h2 winds it down once every handle is gone
    _send: SendRequest<Bytes>,
    ping_pong: PingPong,
    driver: JoinHandle<()>,
}

/// `host:port` and SNI name for `server`
pub fn server_endpoint(server: &str) -> Result<(String, String)> {
    let server = Url::parse(server)
        .map_err(|e| Error::config(format!("invalid ping server {}: {}", server, e)))?;
    let host = server
        .host_str()
        .ok_or_else(|| Error::config(format!("ping server {} has no host", server)))?;
    let port = server
        .port_or_known_default()
        .ok_or_else(|| Error::config(format!("ping server {} has no port", server)))?;
    let sni = host.trim_start_matches('[').trim_end_matches(']').to_string();
    Ok((format!("{}:{}", host, port), sni))
}

impl Http2Session {
    /// Dial `server` through `proxy`, then run the TLS (ALPN `h2`) and
    /// HTTP/2 handshakes.
    pub async fn connect(proxy: &AnyProxy, server: &str) -> Result<Self> {
        let (addr, sni) = server_endpoint(server)?;
        debug!("[{}] dialing ping session to {}", proxy.name(), addr);

        let stream = proxy.dial_tcp(&Metadata::from_addr(&addr)?).await?;
        let tls_stream = tls::connect(tls::client_config(false, &[b"h2"]), &sni, stream).await?;

        let (send, mut connection) = h2::client::handshake(tls_stream).await?;
        let ping_pong = connection
            .ping_pong()
            .ok_or_else(|| Error::protocol("h2 ping handle already taken"))?;

        let name = proxy.name().to_string();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("[{}] ping session closed: {}", name, e);
            }
        });

        Ok(Http2Session {
            _send: send,
            ping_pong,
            driver,
        })
    }

    /// One PING/PONG round trip
    pub async fn ping(&mut self) -> Result<Duration> {
        let start = Instant::now();
        self.ping_pong.ping(Ping::opaque()).await?;
        Ok(start.elapsed())
    }
}

impl Drop for Http2Session {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
