//! Direct outbound (no proxy), also used as the COMPATIBLE placeholder

use super::{ChainedDatagram, ChainedStream, Dialer, OutboundProxy, ProxyType};
use crate::common::Metadata;
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Direct connection (no proxy)
pub struct Direct {
    name: String,
    proxy_type: ProxyType,
}

impl Direct {
    pub fn new() -> Self {
        Self::with_name("DIRECT".to_string())
    }

    pub fn with_name(name: String) -> Self {
        Direct {
            name,
            proxy_type: ProxyType::Direct,
        }
    }

    /// Placeholder a group falls back to when none of its providers has proxies
    pub fn compatible() -> Self {
        Direct {
            name: "COMPATIBLE".to_string(),
            proxy_type: ProxyType::Compatible,
        }
    }
}

impl Default for Direct {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboundProxy for Direct {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        self.proxy_type
    }

    fn support_udp(&self) -> bool {
        true
    }

    fn support_with_dialer(&self) -> bool {
        true
    }

    async fn dial_tcp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedStream> {
        let addr = metadata.remote_address();
        debug!("[{}] connecting to {}", self.name, addr);
        let stream = dialer.dial_tcp(&addr).await?;
        Ok(ChainedStream::new(stream))
    }

    async fn listen_udp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedDatagram> {
        Ok(ChainedDatagram::new(dialer.listen_udp(metadata).await?))
    }
}
