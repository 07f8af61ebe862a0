//! DNS cache implementation

use lru::LruCache;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(n) => n,
    None => unreachable!(),
};

#[derive(Clone, Debug)]
struct CacheEntry {
    ips: Vec<IpAddr>,
    created: Instant,
}

/// DNS cache with LRU eviction and a fixed TTL
pub struct DnsCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl DnsCache {
    pub fn new(max_size: usize) -> Self {
        Self::with_ttl(max_size, Duration::from_secs(300))
    }

    pub fn with_ttl(max_size: usize, ttl: Duration) -> Self {
        DnsCache {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(max_size).unwrap_or(DEFAULT_CAPACITY),
            )),
            ttl,
        }
    }

    /// Unexpired addresses for `domain`
    pub fn get(&self, domain: &str) -> Option<Vec<IpAddr>> {
        let mut cache = self.cache.lock();
        match cache.get(domain) {
            Some(entry) if entry.created.elapsed() <= self.ttl => Some(entry.ips.clone()),
            Some(_) => {
                cache.pop(domain);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, domain: String, ips: Vec<IpAddr>) {
        self.cache.lock().put(
            domain,
            CacheEntry {
                ips,
                created: Instant::now(),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_and_eviction() {
        let cache = DnsCache::with_ttl(2, Duration::from_millis(20));
        let ip: IpAddr = "1.1.1.1".parse().unwrap();

        cache.put("a.com".into(), vec![ip]);
        assert_eq!(cache.get("a.com"), Some(vec![ip]));

        cache.put("b.com".into(), vec![ip]);
        cache.put("c.com".into(), vec![ip]);
        assert_eq!(cache.len(), 2);

        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("c.com").is_none());
    }
}
