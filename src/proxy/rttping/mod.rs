//! HTTP/2 ping group - continuous RTT ranking
//!
//! Every distinct endpoint gets one pinger that keeps an HTTP/2 session open
//! through its proxy and measures PING round trips. The group routes through
//! the pinger with the lowest smoothed RTT, switching only when another one
//! is better by more than the tolerance.

mod dedup;
mod group;
mod http2;
mod pinger;

pub use dedup::EndpointResolver;
pub use group::{found_better, BestRoute, PingerFactory, PingerGroup};
pub use http2::Http2Session;
pub use pinger::{Http2Pinger, Pinger, PingerSnapshot, PingerStatus, RttEstimator};

use super::{GroupBase, GroupOption, GroupType, ProxyGroup};
use crate::common::Metadata;
use crate::config::ProxyGroupConfig;
use crate::dns::DnsResolve;
use crate::outbound::{AnyProxy, ChainedDatagram, ChainedStream, Dialer, OutboundProxy, ProxyType};
use crate::provider::ProxyProvider;
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_PING_SERVER: &str = "https://cloudflare.com";
const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(1000);
/// How often the provider proxy set is compared for changes
const PROVIDER_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct RttPingConfig {
    /// Time between pings; handshakes get five times as long
    pub interval: Duration,
    /// Minimum improvement before the best route moves
    pub tolerance: Duration,
    /// HTTP/2 server that answers the PINGs
    pub server: String,
}

impl Default for RttPingConfig {
    fn default() -> Self {
        RttPingConfig {
            interval: DEFAULT_PING_INTERVAL,
            tolerance: Duration::ZERO,
            server: DEFAULT_PING_SERVER.to_string(),
        }
    }
}

impl RttPingConfig {
    /// `interval` and `tolerance` are milliseconds here
    pub fn from_config(config: &ProxyGroupConfig) -> Result<Self> {
        let interval = match config.interval {
            Some(0) => return Err(Error::config("`interval` must be greater than zero")),
            Some(ms) => Duration::from_millis(ms),
            None => DEFAULT_PING_INTERVAL,
        };
        let server = config
            .server
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| DEFAULT_PING_SERVER.to_string());
        http2::server_endpoint(&server)?;

        Ok(RttPingConfig {
            interval,
            tolerance: Duration::from_millis(config.tolerance.unwrap_or(0)),
            server,
        })
    }
}

pub struct RttPing {
    base: GroupBase,
    pingers: Arc<PingerGroup>,
    disable_udp: bool,
    // proxy set last handed to the pingers
    synced: Mutex<Vec<AnyProxy>>,
    token: CancellationToken,
}

impl RttPing {
    /// Group with HTTP/2 pingers; background loops start right away.
    pub fn new(
        option: &GroupOption,
        providers: Vec<Arc<dyn ProxyProvider>>,
        config: RttPingConfig,
        resolver: Arc<dyn DnsResolve>,
    ) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let pinger_config = config.clone();
        let factory: PingerFactory = Arc::new(move |proxy| {
            Http2Pinger::spawn(pinger_config.clone(), proxy) as Arc<dyn Pinger>
        });
        Self::with_factory(option, providers, config, resolver, factory)
    }

    pub fn with_factory(
        option: &GroupOption,
        providers: Vec<Arc<dyn ProxyProvider>>,
        config: Arc<RttPingConfig>,
        resolver: Arc<dyn DnsResolve>,
        factory: PingerFactory,
    ) -> Result<Arc<Self>> {
        tokio::runtime::Handle::try_current()
            .map_err(|_| Error::internal("http2ping group needs a tokio runtime"))?;

        let pingers = Arc::new(PingerGroup::new(
            config,
            EndpointResolver::new(resolver)?,
            factory,
        ));
        let group = Arc::new(RttPing {
            base: GroupBase::new(option, providers)?,
            pingers,
            disable_udp: option.disable_udp,
            synced: Mutex::new(Vec::new()),
            token: CancellationToken::new(),
        });

        group.pingers.start();
        group.start_polling();
        Ok(group)
    }

    fn start_polling(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let token = self.token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PROVIDER_POLL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(group) = weak.upgrade() else { break };
                group.sync_proxies().await;
            }
            debug!("provider poll loop stopped");
        });
    }

    /// Hand the current proxy set to the pingers if it changed
    async fn sync_proxies(&self) {
        let proxies = self.base.get_proxies(true);
        let changed = {
            let synced = self.synced.lock();
            synced.len() != proxies.len()
                || synced.iter().zip(&proxies).any(|(a, b)| !Arc::ptr_eq(a, b))
        };
        if !changed {
            return;
        }
        self.pingers.set_proxies(&proxies).await;
        *self.synced.lock() = proxies;
    }

    pub fn pingers(&self) -> &PingerGroup {
        &self.pingers
    }

    /// Lowest-RTT proxy, or the first candidate before any measurement
    fn best_proxy(&self, touch: bool) -> AnyProxy {
        match self.pingers.best_proxy() {
            Some(proxy) => proxy,
            None => {
                let proxies = self.base.get_proxies(touch);
                proxies[0].clone()
            }
        }
    }
}

#[async_trait]
impl OutboundProxy for RttPing {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::Http2Ping
    }

    fn support_udp(&self) -> bool {
        !self.disable_udp && self.best_proxy(false).support_udp()
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<ChainedStream> {
        let proxy = self.best_proxy(true);
        self.base.dial_via(&proxy, None, metadata).await
    }

    async fn dial_tcp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedStream> {
        let proxy = self.best_proxy(true);
        self.base.dial_via(&proxy, Some(dialer), metadata).await
    }

    async fn listen_udp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedDatagram> {
        self.best_proxy(true)
            .listen_udp_with_dialer(dialer, metadata)
            .await
    }

    fn unwrap(&self, _metadata: &Metadata, touch: bool) -> Option<AnyProxy> {
        Some(self.best_proxy(touch))
    }

    async fn close(&self) -> Result<()> {
        self.token.cancel();
        self.pingers.close();
        Ok(())
    }
}

#[async_trait]
impl ProxyGroup for RttPing {
    fn base(&self) -> &GroupBase {
        &self.base
    }

    fn group_type(&self) -> GroupType {
        GroupType::Http2Ping
    }

    fn now(&self) -> String {
        self.best_proxy(false).name().to_string()
    }

    async fn set(&self, _name: &str) -> Result<()> {
        Err(Error::unsupported("not implemented"))
    }

    fn force_set(&self, name: &str) {
        warn!("[{}] force set {} ignored: not implemented", self.name(), name);
    }

    fn to_json(&self) -> serde_json::Value {
        let base = self.base();
        serde_json::json!({
            "name": self.name(),
            "type": self.group_type().to_string(),
            "now": self.now(),
            "all": self.all(),
            "pingers": self.pingers.snapshots(),
            "hidden": base.hidden(),
            "icon": base.icon(),
            "udp": self.support_udp(),
        })
    }
}

impl Drop for RttPing {
    fn drop(&mut self) {
        self.token.cancel();
        self.pingers.close();
    }
}

#[cfg(test)]
mod tests {
    use super::dedup::tests::TableResolver;
    use super::group::tests::{at, Recorder};
    use super::*;
    use crate::testing::provider;

    fn config_of(yaml: &str) -> Result<RttPingConfig> {
        let config: ProxyGroupConfig = serde_yaml::from_str(yaml).unwrap();
        RttPingConfig::from_config(&config)
    }

    #[test]
    fn test_config_defaults_and_validation() {
        let config = config_of("{ name: h, type: http2ping, proxies: [a] }").unwrap();
        assert_eq!(config.interval, Duration::from_millis(1000));
        assert_eq!(config.tolerance, Duration::ZERO);
        assert_eq!(config.server, DEFAULT_PING_SERVER);

        let config =
            config_of("{ name: h, type: http2ping, proxies: [a], interval: 250, tolerance: 30 }")
                .unwrap();
        assert_eq!(config.interval, Duration::from_millis(250));
        assert_eq!(config.tolerance, Duration::from_millis(30));

        assert!(config_of("{ name: h, type: http2ping, proxies: [a], interval: 0 }").is_err());
        assert!(config_of("{ name: h, type: http2ping, proxies: [a], server: 'nope' }").is_err());
    }

    async fn wait_for(pingers: &PingerGroup, n: usize) {
        for _ in 0..100 {
            if pingers.len() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pingers never reached {}", n);
    }

    #[tokio::test]
    async fn test_routes_through_best_pinger() {
        let table = TableResolver::new(&[
            ("a.example.com", &["1.1.1.1"]),
            ("b.example.com", &["2.2.2.2"]),
            ("b2.example.com", &["2.2.2.2"]),
        ]);
        let recorder = Recorder::new();
        let option = GroupOption {
            name: "h2".to_string(),
            group_type: GroupType::Http2Ping,
            ..GroupOption::default()
        };
        let group = RttPing::with_factory(
            &option,
            vec![provider(
                "p",
                vec![
                    at("A", "a.example.com:443"),
                    at("B", "b.example.com:443"),
                    at("B2", "b2.example.com:443"),
                ],
            )],
            Arc::new(RttPingConfig::default()),
            table,
            recorder.factory(),
        )
        .unwrap();

        wait_for(group.pingers(), 2).await;
        // nothing measured yet
        assert_eq!(group.now(), "A");

        recorder.set_rtt("B", 40);
        recorder.set_rtt("A", 90);
        group.pingers().refresh_best();
        assert_eq!(group.now(), "B");

        let stream = group
            .dial_tcp(&Metadata::from_addr("example.com:443").unwrap())
            .await
            .unwrap();
        assert_eq!(stream.chains(), &["B".to_string()]);

        assert!(group.set("A").await.is_err());
        let json = group.to_json();
        assert_eq!(json["type"], "Http2Ping");
        assert_eq!(json["pingers"].as_array().unwrap().len(), 2);

        group.close().await.unwrap();
        assert!(group.pingers().is_empty());
    }
}
