//! URLTest proxy group - lowest measured delay, with hysteresis

use super::{GroupBase, GroupOption, GroupType, ProxyGroup};
use crate::common::{Metadata, Single};
use crate::outbound::{AnyProxy, ChainedDatagram, ChainedStream, Dialer, OutboundProxy, ProxyType};
use crate::provider::ProxyProvider;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Window of the cached fastest-node pick
const FAST_NODE_CACHE: Duration = Duration::from_secs(2);

/// Fastest alive proxy in `proxies`, unless `current` is still present,
/// alive and within `tolerance` ms of it.
///
/// `proxies` must not be empty. When nothing is alive the first proxy wins.
pub fn select_fast(proxies: &[AnyProxy], current: Option<&AnyProxy>, tolerance: u16) -> AnyProxy {
    let mut fast = &proxies[0];
    let mut min_delay = fast.last_delay();
    for proxy in &proxies[1..] {
        if !proxy.alive() {
            continue;
        }
        let delay = proxy.last_delay();
        if delay < min_delay {
            fast = proxy;
            min_delay = delay;
        }
    }

    let current = current.and_then(|c| proxies.iter().find(|p| p.name() == c.name()));
    match current {
        Some(cur)
            if cur.alive()
                && u32::from(cur.last_delay()) <= u32::from(fast.last_delay()) + u32::from(tolerance) =>
        {
            cur.clone()
        }
        _ => fast.clone(),
    }
}

pub struct URLTest {
    base: GroupBase,
    tolerance: u16,
    disable_udp: bool,
    selected: RwLock<Option<String>>,
    fast_node: Mutex<Option<AnyProxy>>,
    fast_single: Single<AnyProxy>,
}

impl URLTest {
    pub fn new(option: &GroupOption, providers: Vec<Arc<dyn ProxyProvider>>) -> Result<Self> {
        Ok(URLTest {
            base: GroupBase::new(option, providers)?,
            tolerance: option.tolerance.min(u64::from(u16::MAX)) as u16,
            disable_udp: option.disable_udp,
            selected: RwLock::new(None),
            fast_node: Mutex::new(None),
            fast_single: Single::new(FAST_NODE_CACHE),
        })
    }

    /// Drop the pin only if it still names `name`; a concurrent `set` wins.
    fn unpin(&self, name: &str) {
        let mut selected = self.selected.write();
        if selected.as_deref() == Some(name) {
            *selected = None;
        }
    }

    fn fast(&self, touch: bool) -> AnyProxy {
        let proxies = self.base.get_proxies(touch);

        let pinned = self.selected.read().clone();
        if let Some(name) = pinned {
            match proxies.iter().find(|p| p.name() == name) {
                Some(p) if p.alive() => {
                    *self.fast_node.lock() = Some(p.clone());
                    return p.clone();
                }
                _ => self.unpin(&name),
            }
        }

        let (node, shared) = self.fast_single.run(|| {
            let mut fast_node = self.fast_node.lock();
            let next = select_fast(&proxies, fast_node.as_ref(), self.tolerance);
            if fast_node.as_ref().map(|p| p.name()) != Some(next.name()) {
                info!(
                    "[{}] fast node switched to {} ({} ms)",
                    self.base.name(),
                    next.name(),
                    next.last_delay()
                );
            }
            *fast_node = Some(next.clone());
            next
        });
        // a shared result skipped the touch inside get_proxies
        if shared && touch {
            self.base.touch();
        }
        node
    }
}

#[async_trait]
impl OutboundProxy for URLTest {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::URLTest
    }

    fn support_udp(&self) -> bool {
        !self.disable_udp && self.fast(false).support_udp()
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<ChainedStream> {
        let proxy = self.fast(true);
        self.base.dial_via(&proxy, None, metadata).await
    }

    async fn dial_tcp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedStream> {
        let proxy = self.fast(true);
        self.base.dial_via(&proxy, Some(dialer), metadata).await
    }

    async fn listen_udp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedDatagram> {
        self.fast(true)
            .listen_udp_with_dialer(dialer, metadata)
            .await
    }

    fn unwrap(&self, _metadata: &Metadata, touch: bool) -> Option<AnyProxy> {
        Some(self.fast(touch))
    }
}

#[async_trait]
impl ProxyGroup for URLTest {
    fn base(&self) -> &GroupBase {
        &self.base
    }

    fn group_type(&self) -> GroupType {
        GroupType::URLTest
    }

    fn now(&self) -> String {
        self.fast(false).name().to_string()
    }

    async fn set(&self, name: &str) -> Result<()> {
        if !self.base.get_proxies(false).iter().any(|p| p.name() == name) {
            return Err(Error::not_found(name));
        }
        self.force_set(name);
        self.fast(false);
        Ok(())
    }

    fn force_set(&self, name: &str) {
        *self.selected.write() = Some(name.to_string());
    }

    fn fixed(&self) -> Option<String> {
        self.selected.read().clone()
    }
}
