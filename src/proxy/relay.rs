//! Relay proxy group - every member is one hop of a chain

use super::{GroupBase, GroupOption, GroupType, ProxyGroup, GET_PROXIES_CACHE};
use crate::common::{Metadata, Single};
use crate::outbound::{
    AnyProxy, ChainedDatagram, ChainedStream, Dialer, OutboundProxy, ProxyDialer, ProxyType,
};
use crate::provider::ProxyProvider;
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub struct Relay {
    base: GroupBase,
    members: Single<Vec<AnyProxy>>,
}

/// Resolved chain for one connection
struct Hops {
    /// Concrete hops, first to last
    targets: Vec<AnyProxy>,
    /// Every proxy passed through while unwrapping, groups included
    chain: Vec<AnyProxy>,
}

impl Relay {
    pub fn new(option: &GroupOption, providers: Vec<Arc<dyn ProxyProvider>>) -> Result<Self> {
        Ok(Relay {
            base: GroupBase::new(option, providers)?,
            members: Single::new(GET_PROXIES_CACHE),
        })
    }

    fn members(&self, touch: bool) -> Vec<AnyProxy> {
        let (proxies, shared) = self.members.run(|| self.base.get_proxies(touch));
        if shared && touch {
            self.base.touch();
        }
        proxies
    }

    fn hops(&self, metadata: &Metadata, touch: bool) -> Hops {
        let mut terminals = Vec::new();
        let mut chain = Vec::new();

        for proxy in self.members(touch) {
            chain.push(proxy.clone());
            let mut terminal = proxy;
            while let Some(next) = terminal.unwrap(metadata, touch) {
                chain.push(next.clone());
                terminal = next;
            }
            terminals.push(terminal);
        }

        let mut targets: Vec<AnyProxy> = terminals
            .iter()
            .filter(|p| !matches!(p.proxy_type(), ProxyType::Direct | ProxyType::Compatible))
            .cloned()
            .collect();
        if targets.is_empty() {
            // a lone direct hop stays; get_proxies is never empty
            targets.extend(terminals.into_iter().take(1));
        }
        Hops { targets, chain }
    }

    /// Names of the concrete hops for `metadata`
    pub fn chain_for(&self, metadata: &Metadata) -> Vec<String> {
        self.hops(metadata, false)
            .targets
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }
}

#[async_trait]
impl OutboundProxy for Relay {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Relay
    }

    /// Walk the hops last to first: the first one that can carry UDP over its
    /// own stream settles it, any hop that cannot be reached through a dialer
    /// breaks it.
    fn support_udp(&self) -> bool {
        let hops = self.hops(&Metadata::udp(), false);
        for proxy in hops.targets.iter().rev() {
            if !proxy.support_udp() {
                return false;
            }
            if proxy.support_uot() {
                return true;
            }
            if !proxy.support_with_dialer() {
                return false;
            }
        }
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
        let Hops { mut targets, chain } = self.hops(metadata, true);
        let last = targets
            .pop()
            .ok_or_else(|| Error::internal("relay resolved no hops"))?;

        let mut composed = dialer;
        for hop in targets {
            composed = Arc::new(ProxyDialer::new(hop, composed));
        }
        debug!("[{}] dialing {} through {} hops", self.name(), metadata.remote_address(), chain.len());

        let mut stream = self.base.dial_via(&last, Some(composed), metadata).await?;
        // the last hop already named itself
        for proxy in chain.iter().rev().skip(1) {
            stream.append_to_chains(proxy.name());
        }
        Ok(stream)
    }

    async fn listen_udp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedDatagram> {
        let Hops { mut targets, chain } = self.hops(metadata, true);
        let last = targets
            .pop()
            .ok_or_else(|| Error::internal("relay resolved no hops"))?;

        let mut composed = dialer;
        for hop in targets {
            composed = Arc::new(ProxyDialer::new(hop, composed));
        }
        debug!("[{}] opening udp through {} hops", self.name(), chain.len());

        let mut pc = last.listen_udp_with_dialer(composed, metadata).await?;
        for proxy in chain.iter().rev().skip(1) {
            pc.append_to_chains(proxy.name());
        }
        Ok(pc)
    }
}

#[async_trait]
impl ProxyGroup for Relay {
    fn base(&self) -> &GroupBase {
        &self.base
    }

    fn group_type(&self) -> GroupType {
        GroupType::Relay
    }

    /// Every member is used, there is no single current proxy
    fn now(&self) -> String {
        String::new()
    }

    fn to_json(&self) -> serde_json::Value {
        let base = self.base();
        serde_json::json!({
            "name": self.name(),
            "type": self.group_type().to_string(),
            "all": self.all(),
            "hidden": base.hidden(),
            "icon": base.icon(),
            "udp": self.support_udp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::Proxy;
    use crate::testing::{erase, mock, mock_with_handle, provider, MockProxy, ScriptedProvider};
    use std::sync::atomic::Ordering;
    use tokio::net::UdpSocket;

    fn relay(proxies: Vec<AnyProxy>) -> Relay {
        let option = GroupOption {
            name: "relay".to_string(),
            ..GroupOption::default()
        };
        Relay::new(&option, vec![provider("p", proxies)]).unwrap()
    }

    fn with_caps(name: &str, udp: bool, uot: bool, with_dialer: bool) -> AnyProxy {
        Proxy::new(Arc::new(MockProxy::new(name).with_caps(udp, uot, with_dialer)))
    }

    fn typed(name: &str, proxy_type: ProxyType) -> AnyProxy {
        Proxy::new(Arc::new(MockProxy::new(name).with_type(proxy_type)))
    }

    #[test]
    fn test_udp_broken_by_non_dialer_hop() {
        let a = with_caps("A", true, false, true);
        let b = with_caps("B", true, false, false);
        // B cannot sit behind a dialer, so A in front of it breaks UDP
        assert!(!relay(vec![a.clone(), b.clone()]).support_udp());
        assert!(!relay(vec![b, a]).support_udp());

        // a UDP-over-TCP hop settles it regardless of what sits before
        let b_uot = with_caps("B", true, true, false);
        let a_tcp = with_caps("A", false, false, false);
        assert!(relay(vec![a_tcp, b_uot]).support_udp());
    }

    #[test]
    fn test_udp_needs_every_hop() {
        let a = with_caps("A", false, false, true);
        let b = with_caps("B", true, false, true);
        assert!(!relay(vec![a, b.clone()]).support_udp());
        assert!(relay(vec![b.clone(), b]).support_udp());

        // a dropped DIRECT hop does not count
        let udp = with_caps("C", true, false, true);
        assert!(relay(vec![typed("DIRECT", ProxyType::Direct), udp]).support_udp());
    }

    #[tokio::test]
    async fn test_udp_rides_the_whole_chain() {
        let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 16];
            let (n, from) = echo.recv_from(&mut buf).await.unwrap();
            echo.send_to(&buf[..n], from).await.unwrap();
        });

        let (a, a_handle) = mock_with_handle("A");
        let (b, b_handle) = mock_with_handle("B");
        let group = relay(vec![a, b]);
        assert!(group.support_udp());
        assert_eq!(group.to_json()["udp"], true);

        let metadata = Metadata::udp()
            .with_dst_ip(echo_addr.ip())
            .with_dst_port(echo_addr.port());
        let pc = group.listen_udp(&metadata).await.unwrap();
        assert_eq!(pc.chains(), &["B".to_string(), "A".to_string()]);
        assert_eq!(a_handle.udp_opens(), 1);
        assert_eq!(b_handle.udp_opens(), 1);

        pc.send_to(b"dns?", &echo_addr.to_string()).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = pc.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"dns?");
        assert_eq!(from, echo_addr);
    }

    #[tokio::test]
    async fn test_udp_front_hop_failure_marks_dead() {
        let (a, a_handle) = mock_with_handle("A");
        a_handle.set_fail(true);
        let group = relay(vec![a.clone(), mock("B")]);

        assert!(group.listen_udp(&Metadata::udp()).await.is_err());
        assert!(!a.alive());
    }

    #[test]
    fn test_direct_dropped_unless_alone() {
        let group = relay(vec![mock("A"), typed("DIRECT", ProxyType::Direct), mock("B")]);
        assert_eq!(group.chain_for(&Metadata::tcp()), vec!["A", "B"]);

        let group = relay(vec![typed("DIRECT", ProxyType::Direct)]);
        assert_eq!(group.chain_for(&Metadata::tcp()), vec!["DIRECT"]);
    }

    #[test]
    fn test_member_list_is_memoized() {
        let sub = ScriptedProvider::new("sub", vec![mock("A"), mock("B")]);
        let option = GroupOption {
            name: "relay".to_string(),
            ..GroupOption::default()
        };
        let group = Relay::new(&option, vec![erase(sub.clone())]).unwrap();

        assert_eq!(group.chain_for(&Metadata::tcp()), vec!["A", "B"]);
        sub.replace(vec![mock("C")]);
        // still inside the memo window
        assert_eq!(group.chain_for(&Metadata::tcp()), vec!["A", "B"]);
        assert_eq!(sub.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_groups_unwrap_to_terminal() {
        let x = mock("X");
        let g = Proxy::new(Arc::new(MockProxy::new("G").unwrapping_to(x)));
        let group = relay(vec![g, mock("Y")]);
        assert_eq!(group.chain_for(&Metadata::tcp()), vec!["X", "Y"]);
    }

    #[tokio::test]
    async fn test_dial_records_chain() {
        let x = mock("X");
        let g = Proxy::new(Arc::new(MockProxy::new("G").unwrapping_to(x)));
        let (y, y_handle) = mock_with_handle("Y");
        let group = relay(vec![g, y]);

        let stream = group
            .dial_tcp(&Metadata::from_addr("example.com:443").unwrap())
            .await
            .unwrap();
        assert_eq!(stream.chains(), &["Y".to_string(), "X".to_string(), "G".to_string()]);
        assert_eq!(y_handle.dials(), 1);
    }

    #[tokio::test]
    async fn test_failed_last_hop_marks_dead() {
        let (b, handle) = mock_with_handle("B");
        handle.set_fail(true);
        let group = relay(vec![mock("A"), b.clone()]);

        assert!(group
            .dial_tcp(&Metadata::from_addr("example.com:80").unwrap())
            .await
            .is_err());
        assert!(!b.alive());
    }
}
