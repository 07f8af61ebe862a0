//! LoadBalance proxy group - Distribute load across proxies
//!
//! Three strategies: consistent hashing on the destination site, round-robin
//! over alive proxies, and sticky sessions keyed by source and destination.

use super::{GroupBase, GroupOption, GroupType, ProxyGroup};
use crate::common::Metadata;
use crate::outbound::{AnyProxy, ChainedDatagram, ChainedStream, Dialer, OutboundProxy, ProxyType};
use crate::provider::ProxyProvider;
use crate::{Error, Result};
use async_trait::async_trait;
use lru::LruCache;
use murmur3::murmur3_32;
use parking_lot::Mutex;
use public_suffix::{EffectiveTLDProvider, DEFAULT_PROVIDER};
use std::io::Cursor;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

const MAX_RETRY: u64 = 5;
const STICKY_CAPACITY: usize = 1000;
const STICKY_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// Load balance strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Jump hash of the destination site
    ConsistentHashing,
    /// Shared cursor over alive proxies
    RoundRobin,
    /// Remembered pick per source/destination pair
    StickySessions,
}

impl TryFrom<Option<&str>> for Strategy {
    type Error = Error;

    fn try_from(s: Option<&str>) -> Result<Self> {
        match s {
            None | Some("") | Some("consistent-hashing") => Ok(Strategy::ConsistentHashing),
            Some("round-robin") => Ok(Strategy::RoundRobin),
            Some("sticky-sessions") => Ok(Strategy::StickySessions),
            Some(other) => Err(Error::config(format!("{} is not support", other))),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::ConsistentHashing => write!(f, "consistent-hashing"),
            Strategy::RoundRobin => write!(f, "round-robin"),
            Strategy::StickySessions => write!(f, "sticky-sessions"),
        }
    }
}

/// Jump consistent hash: maps `key` onto `0..buckets`, moving only about
/// `1/(n+1)` of keys when a bucket is added.
pub fn jump_hash(mut key: u64, buckets: i32) -> i32 {
    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < i64::from(buckets) {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b + 1) as f64 * ((1i64 << 31) as f64 / ((key >> 33) + 1) as f64)) as i64;
    }
    b as i32
}

/// Affinity key for a connection: the literal IP if the host is one, else
/// the registrable domain, else the destination IP.
pub fn routing_key(metadata: &Metadata) -> String {
    let host = metadata.host.as_str();
    if !host.is_empty() {
        if host.parse::<IpAddr>().is_ok() {
            return host.to_string();
        }
        if let Ok(etld) = DEFAULT_PROVIDER.effective_tld_plus_one(host) {
            return etld.to_string();
        }
    }
    metadata.dst_ip.map(|ip| ip.to_string()).unwrap_or_default()
}

fn sticky_key(metadata: &Metadata) -> String {
    format!("{}-{}", metadata.src_ip, routing_key(metadata))
}

fn hash_key(key: &str) -> u64 {
    // reading from an in-memory cursor cannot fail
    u64::from(murmur3_32(&mut Cursor::new(key.as_bytes()), 0).unwrap_or_default())
}

fn nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

pub struct LoadBalance {
    base: GroupBase,
    strategy: Strategy,
    disable_udp: bool,
    // round-robin
    cursor: Mutex<usize>,
    // sticky-sessions: key -> (index, stored at)
    sticky: Mutex<LruCache<u64, (usize, Instant)>>,
}

impl LoadBalance {
    pub fn new(option: &GroupOption, providers: Vec<Arc<dyn ProxyProvider>>) -> Result<Self> {
        let strategy = Strategy::try_from(option.strategy.as_deref())?;
        let capacity = NonZeroUsize::new(STICKY_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Ok(LoadBalance {
            base: GroupBase::new(option, providers)?,
            strategy,
            disable_udp: option.disable_udp,
            cursor: Mutex::new(0),
            sticky: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    fn pick(&self, metadata: &Metadata, touch: bool) -> AnyProxy {
        let proxies = self.base.get_proxies(touch);
        match self.strategy {
            Strategy::ConsistentHashing => Self::consistent(&proxies, metadata),
            Strategy::RoundRobin => self.round_robin(&proxies, touch),
            Strategy::StickySessions => self.sticky(&proxies, metadata),
        }
    }

    fn consistent(proxies: &[AnyProxy], metadata: &Metadata) -> AnyProxy {
        let key = hash_key(&routing_key(metadata));
        let buckets = proxies.len() as i32;
        for i in 0..MAX_RETRY {
            let proxy = &proxies[jump_hash(key.wrapping_add(i), buckets) as usize];
            if proxy.alive() {
                return proxy.clone();
            }
        }
        proxies[0].clone()
    }

    fn round_robin(&self, proxies: &[AnyProxy], touch: bool) -> AnyProxy {
        let mut cursor = self.cursor.lock();
        let len = proxies.len();
        let start = *cursor % len;
        for i in 0..len {
            let proxy = &proxies[(start + i) % len];
            if proxy.alive() {
                if touch {
                    *cursor = (start + i + 1) % len;
                }
                return proxy.clone();
            }
        }
        proxies[0].clone()
    }

    fn sticky(&self, proxies: &[AnyProxy], metadata: &Metadata) -> AnyProxy {
        let key = hash_key(&sticky_key(metadata));
        let buckets = proxies.len() as i32;
        let mut cache = self.sticky.lock();

        let cached = match cache.get(&key) {
            Some(&(idx, at)) if at.elapsed() < STICKY_EXPIRY && idx < proxies.len() => Some(idx),
            _ => None,
        };
        let mut idx = cached.unwrap_or_else(|| jump_hash(key.wrapping_add(nanos()), buckets) as usize);

        for _ in 0..MAX_RETRY {
            let proxy = &proxies[idx];
            if proxy.alive() {
                if cached != Some(idx) {
                    cache.put(key, (idx, Instant::now()));
                }
                return proxy.clone();
            }
            idx = jump_hash(key.wrapping_add(nanos()), buckets) as usize;
        }
        cache.put(key, (0, Instant::now()));
        proxies[0].clone()
    }
}

#[async_trait]
impl OutboundProxy for LoadBalance {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn proxy_type(&self) -> ProxyType {
        ProxyType::LoadBalance
    }

    fn support_udp(&self) -> bool {
        !self.disable_udp
    }

    async fn dial_tcp(&self, metadata: &Metadata) -> Result<ChainedStream> {
        let proxy = self.pick(metadata, true);
        self.base.dial_via(&proxy, None, metadata).await
    }

    async fn dial_tcp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedStream> {
        let proxy = self.pick(metadata, true);
        self.base.dial_via(&proxy, Some(dialer), metadata).await
    }

    async fn listen_udp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedDatagram> {
        self.pick(metadata, true)
            .listen_udp_with_dialer(dialer, metadata)
            .await
    }

    fn unwrap(&self, metadata: &Metadata, touch: bool) -> Option<AnyProxy> {
        Some(self.pick(metadata, touch))
    }
}

#[async_trait]
impl ProxyGroup for LoadBalance {
    fn base(&self) -> &GroupBase {
        &self.base
    }

    fn group_type(&self) -> GroupType {
        GroupType::LoadBalance
    }

    /// Picks are per connection, there is no single current proxy
    fn now(&self) -> String {
        String::new()
    }

    fn to_json(&self) -> serde_json::Value {
        let base = self.base();
        serde_json::json!({
            "name": self.name(),
            "type": self.group_type().to_string(),
            "all": self.all(),
            "testUrl": base.test_url(),
            "strategy": self.strategy.to_string(),
            "hidden": base.hidden(),
            "icon": base.icon(),
            "udp": self.support_udp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{dead, mock, provider};
    use std::collections::HashSet;

    fn group(strategy: &str, proxies: Vec<AnyProxy>) -> LoadBalance {
        let option = GroupOption {
            name: "lb".to_string(),
            strategy: Some(strategy.to_string()),
            ..GroupOption::default()
        };
        LoadBalance::new(&option, vec![provider("p", proxies)]).unwrap()
    }

    fn host(host: &str) -> Metadata {
        Metadata::tcp().with_host(host.to_string()).with_dst_port(443)
    }

    #[test]
    fn test_jump_hash_golden() {
        let table: [(u64, i32, i32); 8] = [
            (0, 1, 0),
            (1, 10, 6),
            (42, 10, 2),
            (12345, 100, 29),
            (0xdeadbeef, 7, 5),
            (1 << 63, 1000, 453),
            (7, 3, 0),
            (1000, 2, 0),
        ];
        for (key, buckets, want) in table {
            assert_eq!(jump_hash(key, buckets), want, "key={} buckets={}", key, buckets);
        }
    }

    #[test]
    fn test_jump_hash_range_and_remap() {
        for buckets in 1..40 {
            for key in 0..200u64 {
                let b = jump_hash(key.wrapping_mul(0x9E3779B97F4A7C15), buckets);
                assert!((0..buckets).contains(&b));
            }
        }

        let moved = (0..10_000u64)
            .filter(|&k| jump_hash(k, 10) != jump_hash(k, 11))
            .count();
        let fraction = moved as f64 / 10_000.0;
        assert!((0.06..0.12).contains(&fraction), "fraction={}", fraction);
    }

    #[test]
    fn test_routing_key() {
        assert_eq!(routing_key(&host("www.google.com")), "google.com");
        assert_eq!(routing_key(&host("a.b.example.co.uk")), "example.co.uk");
        assert_eq!(routing_key(&host("10.0.0.1")), "10.0.0.1");

        let ip_only = Metadata::from_addr("1.1.1.1:53").unwrap();
        assert_eq!(routing_key(&ip_only), "1.1.1.1");
        assert_eq!(routing_key(&Metadata::tcp()), "");
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(Strategy::try_from(None).unwrap(), Strategy::ConsistentHashing);
        assert_eq!(Strategy::try_from(Some("round-robin")).unwrap(), Strategy::RoundRobin);
        assert_eq!(
            Strategy::try_from(Some("sticky-sessions")).unwrap(),
            Strategy::StickySessions
        );
        assert!(matches!(Strategy::try_from(Some("random")), Err(Error::Config(_))));
    }

    #[test]
    fn test_consistent_affinity() {
        let proxies: Vec<AnyProxy> = (0..5).map(|i| mock(&format!("p{}", i))).collect();
        let lb = group("consistent-hashing", proxies.clone());

        let first = lb.unwrap(&host("api.github.com"), true).unwrap();
        for sub in ["github.com", "www.github.com", "api.github.com"] {
            let picked = lb.unwrap(&host(sub), true).unwrap();
            assert_eq!(picked.name(), first.name());
        }

        first.set_alive(false);
        let next = lb.unwrap(&host("api.github.com"), true).unwrap();
        assert_ne!(next.name(), first.name());
        assert_eq!(lb.unwrap(&host("github.com"), true).unwrap().name(), next.name());
    }

    #[test]
    fn test_consistent_all_dead_uses_first() {
        let lb = group("consistent-hashing", vec![dead("a"), dead("b"), dead("c")]);
        assert_eq!(lb.unwrap(&host("example.com"), true).unwrap().name(), "a");
    }

    #[test]
    fn test_round_robin_skips_dead() {
        let lb = group("round-robin", vec![mock("a"), dead("b"), mock("c")]);
        let md = host("example.com");
        let picks: Vec<String> = (0..4)
            .map(|_| lb.unwrap(&md, true).unwrap().name().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "c", "a", "c"]);

        // without touch the cursor stays put
        assert_eq!(lb.unwrap(&md, false).unwrap().name(), "a");
        assert_eq!(lb.unwrap(&md, false).unwrap().name(), "a");
    }

    #[test]
    fn test_sticky_sessions() {
        let proxies: Vec<AnyProxy> = (0..4).map(|i| mock(&format!("p{}", i))).collect();
        let lb = group("sticky-sessions", proxies);

        let md = host("example.com").with_source("192.168.1.2:5000".parse().unwrap());
        let first = lb.unwrap(&md, true).unwrap();
        for _ in 0..10 {
            assert_eq!(lb.unwrap(&md, true).unwrap().name(), first.name());
        }

        first.set_alive(false);
        let moved = lb.unwrap(&md, true).unwrap();
        assert!(moved.alive());
        assert_eq!(lb.unwrap(&md, true).unwrap().name(), moved.name());

        let mut seen = HashSet::new();
        for i in 1..60u8 {
            let md = host("example.com")
                .with_source(format!("10.0.0.{}:5000", i).parse().unwrap());
            seen.insert(lb.unwrap(&md, true).unwrap().name().to_string());
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_status_json() {
        let lb = group("round-robin", vec![mock("a")]);
        let json = lb.to_json();
        assert_eq!(json["type"], "LoadBalance");
        assert_eq!(json["strategy"], "round-robin");
        assert!(json.get("now").is_none());
    }
}
