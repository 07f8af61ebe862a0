//! Network utilities

use crate::{Error, Result};
use socket2::SockRef;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Connection timeout for raw TCP dials
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[inline]
pub fn configure_tcp_stream(stream: &TcpStream) {
    let _ = stream.set_nodelay(true);
    let sock = SockRef::from(stream);
    let _ = sock.set_keepalive(true);
}

/// Dial `addr` (`host:port`) with [`CONNECT_TIMEOUT`] and the usual socket options.
pub async fn connect_tcp(addr: &str) -> Result<TcpStream> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::timeout(format!("connect to {} timed out", addr)))?
        .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", addr, e)))?;
    configure_tcp_stream(&stream);
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_tcp_sets_nodelay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let stream = connect_tcp(&addr).await.unwrap();
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_tcp_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = connect_tcp(&addr).await.unwrap_err();
        assert!(err.is_dial_error());
    }
}
