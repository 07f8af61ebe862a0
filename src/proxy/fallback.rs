//! Fallback proxy group - first alive proxy in declared order

use super::{GroupBase, GroupOption, GroupType, ProxyGroup};
use crate::common::Metadata;
use crate::outbound::{
    AnyProxy, ChainedDatagram, ChainedStream, Dialer, OutboundProxy, ProxyType,
    DEFAULT_URL_TEST_TIMEOUT,
};
use crate::provider::ProxyProvider;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

pub struct Fallback {
    base: GroupBase,
    /// Pinned choice, honoured while alive
    selected: RwLock<Option<String>>,
    disable_udp: bool,
}

impl Fallback {
    pub fn new(option: &GroupOption, providers: Vec<Arc<dyn ProxyProvider>>) -> Result<Self> {
        Ok(Fallback {
            base: GroupBase::new(option, providers)?,
            selected: RwLock::new(None),
            disable_udp: option.disable_udp,
        })
    }

    /// Drop the pin only if it still names `name`; a concurrent `set` wins.
    fn unpin(&self, name: &str) {
        let mut selected = self.selected.write();
        if selected.as_deref() == Some(name) {
            *selected = None;
        }
    }

    fn find_alive_proxy(&self, touch: bool) -> AnyProxy {
        let proxies = self.base.get_proxies(touch);

        let pinned = self.selected.read().clone();
        if let Some(name) = pinned {
            match proxies.iter().find(|p| p.name() == name) {
                Some(p) if p.alive() => return p.clone(),
                _ => {
                    debug!("[{}] pinned {} is gone or dead, unpinning", self.base.name(), name);
                    self.unpin(&name);
                }
            }
        }

        proxies
            .iter()
            .find(|p| p.alive())
            .unwrap_or(&proxies[0])
            .clone()
    }
}

#[async_trait]
impl OutboundProxy for Fallback {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Fallback
    }

    fn support_udp(&self) -> bool {
        !self.disable_udp && self.find_alive_proxy(false).support_udp()
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<ChainedStream> {
        let proxy = self.find_alive_proxy(true);
        self.base.dial_via(&proxy, None, metadata).await
    }

    async fn dial_tcp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedStream> {
        let proxy = self.find_alive_proxy(true);
        self.base.dial_via(&proxy, Some(dialer), metadata).await
    }

    async fn listen_udp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedDatagram> {
        self.find_alive_proxy(true)
            .listen_udp_with_dialer(dialer, metadata)
            .await
    }

    fn unwrap(&self, _metadata: &Metadata, touch: bool) -> Option<AnyProxy> {
        Some(self.find_alive_proxy(touch))
    }
}

#[async_trait]
impl ProxyGroup for Fallback {
    fn base(&self) -> &GroupBase {
        &self.base
    }

    fn group_type(&self) -> GroupType {
        GroupType::Fallback
    }

    fn now(&self) -> String {
        self.find_alive_proxy(false).name().to_string()
    }

    /// Pin `name`; a dead pin is probed once so it can take effect right away.
    async fn set(&self, name: &str) -> Result<()> {
        let proxy = self
            .base
            .get_proxies(false)
            .into_iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| Error::not_found(name))?;

        *self.selected.write() = Some(name.to_string());
        if !proxy.alive() {
            let _ = proxy
                .url_test(
                    self.base.test_url(),
                    self.base.expected_status(),
                    DEFAULT_URL_TEST_TIMEOUT,
                )
                .await;
        }
        Ok(())
    }

    fn force_set(&self, name: &str) {
        *self.selected.write() = Some(name.to_string());
    }

    fn fixed(&self) -> Option<String> {
        self.selected.read().clone()
    }
}
