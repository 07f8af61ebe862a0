//! HTTP proxy outbound
//!
//! Implements HTTP CONNECT method for tunneling TCP connections
//! through an HTTP proxy server, optionally over TLS.

use super::{ChainedStream, Dialer, OutboundProxy, ProxyType};
use crate::common::{tls, Metadata};
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// HTTP proxy outbound
pub struct HttpProxy {
    name: String,
    server: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    tls: bool,
    skip_cert_verify: bool,
}

impl HttpProxy {
    pub fn new(
        name: String,
        server: String,
        port: u16,
        username: Option<String>,
        password: Option<String>,
        tls: bool,
        skip_cert_verify: bool,
    ) -> Self {
        HttpProxy {
            name,
            server,
            port,
            username,
            password,
            tls,
            skip_cert_verify,
        }
    }

    /// Build the Authorization header value
    fn auth_header(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                let credentials = format!("{}:{}", user, pass);
                let encoded = base64::engine::general_purpose::STANDARD.encode(credentials);
                Some(format!("Basic {}", encoded))
            }
            _ => None,
        }
    }

    /// Perform HTTP CONNECT handshake
    async fn http_connect<S: AsyncRead + AsyncWrite + Unpin>(
        &self,
        stream: &mut S,
        target: &str,
    ) -> Result<()> {
        let mut request = format!(
            "CONNECT {} HTTP/1.1\r\n\
             Host: {}\r\n\
             Proxy-Connection: keep-alive\r\n",
            target, target
        );
        if let Some(auth) = self.auth_header() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("\r\n");

        debug!("[{}] Sending CONNECT to {}", self.name, target);

        stream.write_all(request.as_bytes()).await.map_err(|e| {
            Error::connection(format!("Failed to send CONNECT request: {}", e))
        })?;
        stream.flush().await?;

        // read byte by byte so no tunnelled payload is consumed past the header
        let mut response = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await.map_err(|e| {
                Error::connection(format!("Failed to read CONNECT response: {}", e))
            })?;
            if n == 0 {
                return Err(Error::connection("Connection closed during CONNECT"));
            }
            response.push(byte[0]);

            if response.ends_with(b"\r\n\r\n") {
                break;
            }
            if response.len() >= 8192 {
                return Err(Error::connection("CONNECT response too large"));
            }
        }

        let head = String::from_utf8_lossy(&response);
        let status_line = head.lines().next().unwrap_or("");
        match parse_status(status_line) {
            Some(200) => Ok(()),
            Some(407) => Err(Error::auth("Proxy authentication required")),
            _ => Err(Error::connection(format!("CONNECT failed: {}", status_line))),
        }
    }
}

fn parse_status(status_line: &str) -> Option<u16> {
    status_line.split_whitespace().nth(1)?.parse().ok()
}

#[async_trait]
impl OutboundProxy for HttpProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Http
    }

    fn addr(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    fn support_udp(&self) -> bool {
        false
    }

    fn support_with_dialer(&self) -> bool {
        true
    }

    async fn dial_tcp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedStream> {
        if !metadata.valid() {
            return Err(Error::connection("No destination address"));
        }
        let target = metadata.remote_address();
        let mut stream = dialer.dial_tcp(&self.addr()).await?;

        if self.tls {
            let config = tls::client_config(self.skip_cert_verify, &[]);
            let mut tls_stream = tls::connect(config, &self.server, stream).await?;
            self.http_connect(&mut tls_stream, &target).await?;
            debug!("[{}] HTTP proxy connected to {} (TLS)", self.name, target);
            Ok(ChainedStream::new(Box::new(tls_stream)))
        } else {
            self.http_connect(&mut stream, &target).await?;
            debug!("[{}] HTTP proxy connected to {}", self.name, target);
            Ok(ChainedStream::new(stream))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn proxy(user: Option<&str>, pass: Option<&str>) -> HttpProxy {
        HttpProxy::new(
            "h".into(),
            "127.0.0.1".into(),
            8080,
            user.map(String::from),
            pass.map(String::from),
            false,
            false,
        )
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(parse_status("HTTP/1.1 200 Connection established"), Some(200));
        assert_eq!(parse_status("HTTP/1.0 407 Proxy Authentication Required"), Some(407));
        assert_eq!(parse_status("garbage"), None);
    }

    #[test]
    fn test_auth_header() {
        assert!(proxy(None, None).auth_header().is_none());
        assert_eq!(
            proxy(Some("user"), Some("pass")).auth_header().unwrap(),
            "Basic dXNlcjpwYXNz"
        );
    }

    #[tokio::test]
    async fn test_connect_leaves_payload_unread() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\nhello")
                .await
                .unwrap();
        });

        proxy(None, None)
            .http_connect(&mut client, "example.com:443")
            .await
            .unwrap();
        let mut rest = [0u8; 5];
        client.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"hello");
    }

    #[tokio::test]
    async fn test_connect_auth_required() {
        let (mut client, mut server) = duplex(1024);
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let err = proxy(None, None)
            .http_connect(&mut client, "example.com:443")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }
}
