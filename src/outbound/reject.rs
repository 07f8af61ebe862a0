//! Reject outbound (block connections)

use super::{ChainedStream, Dialer, OutboundProxy, ProxyType};
use crate::common::Metadata;
use crate::Result;
use async_trait::async_trait;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Sleep};
use tracing::debug;

/// How long a dropped connection stays silent before reporting EOF
const DROP_HOLD: Duration = Duration::from_secs(30);

/// Reject connection - immediately closes or drops
pub struct Reject {
    name: String,
    drop: bool,
}

impl Reject {
    pub fn new(drop: bool) -> Self {
        let name = if drop { "REJECT-DROP" } else { "REJECT" };
        Self::with_name(name.to_string(), drop)
    }

    pub fn with_name(name: String, drop: bool) -> Self {
        Reject { name, drop }
    }
}

#[async_trait]
impl OutboundProxy for Reject {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        if self.drop {
            ProxyType::RejectDrop
        } else {
            ProxyType::Reject
        }
    }

    fn support_udp(&self) -> bool {
        false
    }

    async fn dial_tcp_with_dialer(
        &self,
        _dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedStream> {
        debug!("{} connection to {}", self.name, metadata.remote_address());

        if self.drop {
            Ok(ChainedStream::new(Box::new(RejectConn {
                hold: Some(Box::pin(sleep(DROP_HOLD))),
            })))
        } else {
            Ok(ChainedStream::new(Box::new(RejectConn { hold: None })))
        }
    }
}

/// Swallows writes; reads report EOF, after `hold` expires if one is set
struct RejectConn {
    hold: Option<Pin<Box<Sleep>>>,
}

impl AsyncRead for RejectConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(hold) = this.hold.as_mut() {
            if hold.as_mut().poll(cx).is_pending() {
                return Poll::Pending;
            }
            this.hold = None;
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for RejectConn {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
