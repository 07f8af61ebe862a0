//! Pinger registry and best-route tracking

use super::dedup::EndpointResolver;
use super::pinger::{Pinger, PingerSnapshot};
use super::RttPingConfig;
use crate::outbound::AnyProxy;
use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Builds the pinger for a newly seen endpoint
pub type PingerFactory = Arc<dyn Fn(AnyProxy) -> Arc<dyn Pinger> + Send + Sync>;

/// Samples at or above this are never picked
const RTT_CEILING: u32 = (1 << 31) - 1;

pub struct BestRoute {
    pub key: String,
    pub pinger: Arc<dyn Pinger>,
}

/// Whether `new` should replace `old` as the best route.
///
/// Any candidate beats no route; a missing or identical candidate never
/// wins; otherwise the improvement must exceed `tolerance`.
pub fn found_better(old: Option<&BestRoute>, new: Option<&BestRoute>, tolerance: Duration) -> bool {
    match (old, new) {
        (None, Some(_)) => true,
        (_, None) => false,
        (Some(old), Some(new)) if old.key == new.key => false,
        (Some(old), Some(new)) => {
            let old_rtt = i64::from(old.pinger.smooth_rtt());
            let new_rtt = i64::from(new.pinger.smooth_rtt());
            let better = old_rtt - new_rtt > tolerance.as_millis() as i64;
            if better {
                debug!(
                    "change best route from [{}][rtt: {}ms] to [{}][rtt: {}ms]",
                    old.pinger.proxy().name(),
                    old_rtt,
                    new.pinger.proxy().name(),
                    new_rtt
                );
            }
            better
        }
    }
}

pub struct PingerGroup {
    config: Arc<RttPingConfig>,
    resolver: EndpointResolver,
    factory: PingerFactory,
    pingers: RwLock<HashMap<String, Arc<dyn Pinger>>>,
    best: ArcSwapOption<BestRoute>,
    token: CancellationToken,
}

impl PingerGroup {
    pub fn new(config: Arc<RttPingConfig>, resolver: EndpointResolver, factory: PingerFactory) -> Self {
        PingerGroup {
            config,
            resolver,
            factory,
            pingers: RwLock::new(HashMap::new()),
            best: ArcSwapOption::empty(),
            token: CancellationToken::new(),
        }
    }

    /// Re-key the pingers to `proxies`: one per resolved endpoint, reusing
    /// existing pingers and closing those whose endpoint is gone.
    pub async fn set_proxies(&self, proxies: &[AnyProxy]) {
        let mut keyed = Vec::with_capacity(proxies.len());
        for proxy in proxies {
            match self.resolver.endpoint_key(&proxy.addr()).await {
                Ok(key) => keyed.push((key, proxy.clone())),
                Err(e) => warn!("resolve domain error for {}: {}", proxy.addr(), e),
            }
        }

        let stale = {
            let mut pingers = self.pingers.write();
            let mut old = std::mem::take(&mut *pingers);
            for (key, proxy) in keyed {
                if pingers.contains_key(&key) {
                    debug!("duplicate proxy [{}] with addr: {}", proxy.name(), key);
                    continue;
                }
                let pinger = match old.remove(&key) {
                    Some(existing) => existing,
                    None => {
                        info!("add proxy [{}:{}] with addr: {}", proxy.name(), proxy.addr(), key);
                        (self.factory)(proxy)
                    }
                };
                pingers.insert(key, pinger);
            }
            old
        };

        for pinger in stale.values() {
            pinger.close();
        }
        if let Some(best) = self.best.load_full() {
            if stale.contains_key(&best.key) {
                self.best.store(None);
            }
        }
    }

    /// Recompute the best route once
    pub fn refresh_best(&self) {
        let candidate = {
            let pingers = self.pingers.read();
            let mut min_rtt = RTT_CEILING;
            let mut best = None;
            for (key, pinger) in pingers.iter() {
                let rtt = pinger.smooth_rtt();
                if rtt > 0 && rtt < min_rtt {
                    min_rtt = rtt;
                    best = Some(BestRoute {
                        key: key.clone(),
                        pinger: pinger.clone(),
                    });
                }
            }
            best
        };

        let old = self.best.load_full();
        if found_better(old.as_deref(), candidate.as_ref(), self.config.tolerance) {
            if let Some(new) = &candidate {
                info!("best route is now {} (sRtt {}ms)", new.pinger.proxy().name(), new.pinger.smooth_rtt());
            }
            self.best.store(candidate.map(Arc::new));
        }
    }

    pub fn best_proxy(&self) -> Option<AnyProxy> {
        self.best.load_full().map(|b| b.pinger.proxy().clone())
    }

    pub fn len(&self) -> usize {
        self.pingers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshots(&self) -> Vec<PingerSnapshot> {
        let mut all: Vec<_> = self.pingers.read().values().map(|p| p.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Refresh the best route every interval until `close`
    pub fn start(self: &Arc<Self>) {
        let group = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(group.config.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = group.token.cancelled() => break,
                    _ = ticker.tick() => group.refresh_best(),
                }
            }
        });
    }

    pub fn close(&self) {
        self.token.cancel();
        for pinger in self.pingers.write().drain().map(|(_, p)| p) {
            pinger.close();
        }
        self.best.store(None);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::super::dedup::tests::TableResolver;
    use super::super::pinger::PingerStatus;
    use super::*;
    use crate::outbound::Proxy;
    use crate::testing::MockProxy;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

    /// Pinger with a scripted RTT
    pub(crate) struct FixedPinger {
        proxy: AnyProxy,
        pub rtt: AtomicU32,
        pub closed: AtomicBool,
    }

    impl FixedPinger {
        pub fn new(proxy: AnyProxy, rtt: u32) -> Arc<Self> {
            Arc::new(FixedPinger {
                proxy,
                rtt: AtomicU32::new(rtt),
                closed: AtomicBool::new(false),
            })
        }
    }

    impl Pinger for FixedPinger {
        fn proxy(&self) -> &AnyProxy {
            &self.proxy
        }

        fn smooth_rtt(&self) -> u32 {
            self.rtt.load(Ordering::SeqCst)
        }

        fn snapshot(&self) -> PingerSnapshot {
            PingerSnapshot {
                name: self.proxy.name().to_string(),
                status: PingerStatus::Idle,
                latest_rtt: self.smooth_rtt(),
                s_rtt: self.smooth_rtt(),
                mean_deviation: 0,
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    /// Factory handing out dead `FixedPinger`s, remembered by proxy name
    pub(crate) struct Recorder {
        pub made: RwLock<HashMap<String, Arc<FixedPinger>>>,
        pub calls: AtomicUsize,
    }

    impl Recorder {
        pub fn new() -> Arc<Self> {
            Arc::new(Recorder {
                made: RwLock::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn factory(self: &Arc<Self>) -> PingerFactory {
            let recorder = self.clone();
            Arc::new(move |proxy: AnyProxy| {
                recorder.calls.fetch_add(1, Ordering::SeqCst);
                let pinger = FixedPinger::new(proxy.clone(), u32::MAX);
                recorder.made.write().insert(proxy.name().to_string(), pinger.clone());
                pinger as Arc<dyn Pinger>
            })
        }

        pub fn set_rtt(&self, name: &str, rtt: u32) {
            self.made.read()[name].rtt.store(rtt, Ordering::SeqCst);
        }
    }

    pub(crate) fn at(name: &str, addr: &str) -> AnyProxy {
        Proxy::new(Arc::new(MockProxy::new(name).with_addr(addr)))
    }

    fn route(key: &str, rtt: u32) -> BestRoute {
        BestRoute {
            key: key.to_string(),
            pinger: FixedPinger::new(at(key, "x:1"), rtt),
        }
    }

    fn group(recorder: &Arc<Recorder>, tolerance: u64) -> PingerGroup {
        let table = TableResolver::new(&[
            ("a.example.com", &["1.1.1.1"]),
            ("a2.example.com", &["1.1.1.1"]),
            ("b.example.com", &["2.2.2.2"]),
            ("c.example.com", &["3.3.3.3"]),
        ]);
        let config = RttPingConfig {
            tolerance: Duration::from_millis(tolerance),
            ..RttPingConfig::default()
        };
        PingerGroup::new(
            Arc::new(config),
            EndpointResolver::new(table).unwrap(),
            recorder.factory(),
        )
    }

    #[test]
    fn test_found_better() {
        let tol = Duration::from_millis(10);
        let a = route("a", 100);
        assert!(found_better(None, Some(&a), tol));
        assert!(!found_better(None, None, tol));
        assert!(!found_better(Some(&a), None, tol));
        assert!(!found_better(Some(&a), Some(&route("a", 10)), tol));
        assert!(!found_better(Some(&a), Some(&route("b", 90)), tol));
        assert!(found_better(Some(&a), Some(&route("b", 89)), tol));
        assert!(!found_better(Some(&a), Some(&route("b", 150)), tol));
        assert!(found_better(Some(&route("a", u32::MAX)), Some(&route("b", 500)), tol));
    }

    #[tokio::test]
    async fn test_set_proxies_dedups_and_reuses() {
        let recorder = Recorder::new();
        let g = group(&recorder, 0);

        let a = at("A", "a.example.com:443");
        let a2 = at("A2", "a2.example.com:443");
        let b = at("B", "b.example.com:443");
        let bad = at("X", "nx.example.com:443");
        g.set_proxies(&[a.clone(), a2.clone(), b.clone(), bad]).await;
        assert_eq!(g.len(), 2);
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);

        g.set_proxies(&[a.clone(), b.clone()]).await;
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);

        g.set_proxies(&[a, at("C", "c.example.com:443")]).await;
        assert_eq!(g.len(), 2);
        assert!(recorder.made.read()["B"].closed.load(Ordering::SeqCst));
        assert!(!recorder.made.read()["A"].closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_best_route_with_tolerance() {
        let recorder = Recorder::new();
        let g = group(&recorder, 20);
        g.set_proxies(&[
            at("A", "a.example.com:443"),
            at("B", "b.example.com:443"),
            at("C", "c.example.com:443"),
        ])
        .await;

        g.refresh_best();
        assert!(g.best_proxy().is_none());

        recorder.set_rtt("A", 100);
        recorder.set_rtt("B", 150);
        g.refresh_best();
        assert_eq!(g.best_proxy().unwrap().name(), "A");

        recorder.set_rtt("B", 81);
        g.refresh_best();
        assert_eq!(g.best_proxy().unwrap().name(), "A");

        recorder.set_rtt("B", 79);
        g.refresh_best();
        assert_eq!(g.best_proxy().unwrap().name(), "B");

        // the holder dies: anything alive beats infinity
        recorder.set_rtt("B", u32::MAX);
        g.refresh_best();
        assert_eq!(g.best_proxy().unwrap().name(), "A");

        // zero means no sample yet
        recorder.set_rtt("C", 0);
        g.refresh_best();
        assert_eq!(g.best_proxy().unwrap().name(), "A");
    }

    #[tokio::test]
    async fn test_removed_best_is_forgotten() {
        let recorder = Recorder::new();
        let g = group(&recorder, 0);
        let a = at("A", "a.example.com:443");
        g.set_proxies(&[a.clone(), at("B", "b.example.com:443")]).await;
        recorder.set_rtt("B", 10);
        g.refresh_best();
        assert_eq!(g.best_proxy().unwrap().name(), "B");

        g.set_proxies(&[a]).await;
        assert!(g.best_proxy().is_none());

        g.close();
        assert!(g.is_empty());
        assert!(recorder.made.read()["A"].closed.load(Ordering::SeqCst));
    }
}
