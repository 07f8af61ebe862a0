//! Selector proxy group - Manual proxy selection

use super::{GroupBase, GroupOption, GroupType, ProxyGroup, GET_PROXIES_CACHE};
use crate::common::{Metadata, Single};
use crate::outbound::{AnyProxy, ChainedDatagram, ChainedStream, Dialer, OutboundProxy, ProxyType};
use crate::provider::ProxyProvider;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

/// Selector proxy group for manual selection
pub struct Selector {
    base: GroupBase,
    selected: RwLock<String>,
    single: Single<AnyProxy>,
    disable_udp: bool,
}

impl Selector {
    pub fn new(option: &GroupOption, providers: Vec<Arc<dyn ProxyProvider>>) -> Result<Self> {
        let base = GroupBase::new(option, providers)?;
        let selected = base
            .get_proxies(false)
            .first()
            .map(|p| p.name().to_string())
            .unwrap_or_default();

        Ok(Selector {
            base,
            selected: RwLock::new(selected),
            single: Single::new(GET_PROXIES_CACHE),
            disable_udp: option.disable_udp,
        })
    }

    /// The bound proxy, or the first candidate once it has vanished
    fn selected_proxy(&self, touch: bool) -> AnyProxy {
        let (proxy, shared) = self.single.run(|| {
            let proxies = self.base.get_proxies(touch);
            let selected = self.selected.read();
            proxies
                .iter()
                .find(|p| p.name() == selected.as_str())
                .unwrap_or(&proxies[0])
                .clone()
        });
        if shared && touch {
            self.base.touch();
        }
        proxy
    }
}

#[async_trait]
impl OutboundProxy for Selector {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Selector
    }

    fn support_udp(&self) -> bool {
        !self.disable_udp && self.selected_proxy(false).support_udp()
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<ChainedStream> {
        let proxy = self.selected_proxy(true);
        self.base.dial_via(&proxy, None, metadata).await
    }

    async fn dial_tcp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedStream> {
        let proxy = self.selected_proxy(true);
        self.base.dial_via(&proxy, Some(dialer), metadata).await
    }

    async fn listen_udp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedDatagram> {
        self.selected_proxy(true)
            .listen_udp_with_dialer(dialer, metadata)
            .await
    }

    fn unwrap(&self, _metadata: &Metadata, touch: bool) -> Option<AnyProxy> {
        Some(self.selected_proxy(touch))
    }
}

#[async_trait]
impl ProxyGroup for Selector {
    fn base(&self) -> &GroupBase {
        &self.base
    }

    fn group_type(&self) -> GroupType {
        GroupType::Selector
    }

    fn now(&self) -> String {
        self.selected_proxy(false).name().to_string()
    }

    async fn set(&self, name: &str) -> Result<()> {
        if !self.base.get_proxies(false).iter().any(|p| p.name() == name) {
            return Err(Error::not_found(name));
        }
        self.force_set(name);
        Ok(())
    }

    fn force_set(&self, name: &str) {
        *self.selected.write() = name.to_string();
        self.single.reset();
    }
}
