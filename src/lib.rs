//! Mihomo Groups - proxy selection and health monitoring
//!
//! Turns a list of upstream proxies into policy groups that pick one of
//! them per connection:
//! - Selector, Fallback, URLTest and LoadBalance over health-checked sets
//! - Relay chains that tunnel hop by hop
//! - HTTP/2 ping groups that rank endpoints by continuous RTT
//! - File and HTTP subscription providers with background refresh
//!
//! # Architecture
//!
//! ```text
//!            +--------------------+
//!            |  OutboundManager   |
//!            +---------+----------+
//!                      |
//!        +-------------+-------------+
//!        |                           |
//! +------v------+            +-------v-------+
//! |   proxy/    |----------->|   provider/   |
//! |  (groups)   |            | (subscripts)  |
//! +------+------+            +-------+-------+
//!        |                           |
//! +------v------+            +-------v-------+
//! |  outbound/  |<-----------| healthcheck   |
//! | (adapters)  |            |  (probing)    |
//! +-------------+            +---------------+
//! ```

pub mod common;
pub mod config;
pub mod dns;
pub mod outbound;
pub mod provider;
pub mod proxy;

#[cfg(test)]
mod testing;

pub use common::error::{Error, Result};
pub use config::Config;

use common::Metadata;
use dns::DnsResolve;
use outbound::{AnyProxy, ChainedStream, Direct, OutboundProxy, Proxy, Reject};
use provider::{ProviderManager, ProxyProvider};
use proxy::{parse_proxy_group, sort_groups, GroupContext, ProxyGroup};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub const VERSION: &str = "1.10.0";

/// Constructed but not yet started outbounds
struct Outbounds {
    proxies: HashMap<String, AnyProxy>,
    groups: HashMap<String, Arc<dyn ProxyGroup>>,
    providers: HashMap<String, Arc<dyn ProxyProvider>>,
}

impl Outbounds {
    fn build(config: &Config, resolver: Arc<dyn DnsResolve>) -> Result<Self> {
        let mut proxies: HashMap<String, AnyProxy> = HashMap::new();
        let builtins: [Arc<dyn OutboundProxy>; 3] = [
            Arc::new(Direct::new()),
            Arc::new(Reject::new(false)),
            Arc::new(Reject::new(true)),
        ];
        for adapter in builtins {
            let proxy = Proxy::new(adapter);
            proxies.insert(proxy.name().to_string(), proxy);
        }

        for proxy_config in &config.proxies {
            let proxy = Proxy::new(outbound::build_adapter(proxy_config)?);
            if proxies.insert(proxy.name().to_string(), proxy).is_some() {
                return Err(Error::config(format!(
                    "proxy {} is duplicated",
                    proxy_config.name
                )));
            }
        }
        info!("Loaded {} proxies", proxies.len());

        let mut providers: HashMap<String, Arc<dyn ProxyProvider>> = HashMap::new();
        for (name, provider_config) in &config.proxy_providers {
            let provider = provider::build_provider(name, provider_config, config.suspended)?;
            providers.insert(name.clone(), provider);
        }

        let ctx = GroupContext {
            suspended: config.suspended,
            resolver,
        };
        let mut groups = HashMap::new();
        for group_config in sort_groups(&config.proxy_groups)? {
            let parsed = parse_proxy_group(group_config, &proxies, &mut providers, &ctx)?;
            proxies.insert(group_config.name.clone(), parsed.proxy);
            groups.insert(group_config.name.clone(), parsed.group);
        }
        info!("Loaded {} proxy groups", groups.len());

        Ok(Outbounds {
            proxies,
            groups,
            providers,
        })
    }
}

/// Every proxy, provider and group built from one configuration
pub struct OutboundManager {
    proxies: HashMap<String, AnyProxy>,
    groups: HashMap<String, Arc<dyn ProxyGroup>>,
    // configuration order, for status output
    group_names: Vec<String>,
    providers: ProviderManager,
}

impl OutboundManager {
    /// Build everything from `config` with a resolver for `config.dns`
    pub async fn new(config: &Config) -> Result<Self> {
        let resolver = Arc::new(dns::Resolver::new(&config.dns)?);
        Self::with_resolver(config, resolver).await
    }

    pub async fn with_resolver(config: &Config, resolver: Arc<dyn DnsResolve>) -> Result<Self> {
        let Outbounds {
            proxies,
            groups,
            providers,
        } = Outbounds::build(config, resolver)?;

        let manager = ProviderManager::new();
        for provider in providers.into_values() {
            if let Err(e) = provider.initial().await {
                warn!("initial proxy provider {} error: {}", provider.name(), e);
            }
            manager.add_proxy_provider(provider).await;
        }

        Ok(OutboundManager {
            proxies,
            groups,
            group_names: config.proxy_groups.iter().map(|g| g.name.clone()).collect(),
            providers: manager,
        })
    }

    /// Build every proxy, provider and group of `config` without loading
    /// providers or starting health checks, then tear the groups down again.
    pub async fn verify(config: &Config) -> Result<()> {
        let resolver = Arc::new(dns::Resolver::new(&config.dns)?);
        let outbounds = Outbounds::build(config, resolver)?;
        for group in outbounds.groups.values() {
            group.close().await?;
        }
        Ok(())
    }

    /// Concrete proxy or group by name
    pub fn proxy(&self, name: &str) -> Option<AnyProxy> {
        self.proxies.get(name).cloned()
    }

    pub fn group(&self, name: &str) -> Option<Arc<dyn ProxyGroup>> {
        self.groups.get(name).cloned()
    }

    /// Groups in configuration order
    pub fn groups(&self) -> Vec<Arc<dyn ProxyGroup>> {
        self.group_names
            .iter()
            .filter_map(|name| self.groups.get(name).cloned())
            .collect()
    }

    pub async fn provider(&self, name: &str) -> Option<Arc<dyn ProxyProvider>> {
        self.providers.get_proxy_provider(name).await
    }

    /// Dial `metadata` through the proxy or group called `name`
    pub async fn dial_tcp(&self, name: &str, metadata: &Metadata) -> Result<ChainedStream> {
        let proxy = self.proxy(name).ok_or_else(|| Error::not_found(name))?;
        proxy.dial_tcp(metadata).await
    }

    /// Manual selection on a group
    pub async fn select(&self, group: &str, proxy: &str) -> Result<()> {
        let group = self.group(group).ok_or_else(|| Error::not_found(group))?;
        group.set(proxy).await
    }

    /// Status of every proxy and group, keyed by name
    pub fn status(&self) -> serde_json::Value {
        let mut all = serde_json::Map::new();
        for (name, proxy) in &self.proxies {
            let json = match self.groups.get(name) {
                Some(group) => group.to_json(),
                None => proxy.to_json(),
            };
            all.insert(name.clone(), json);
        }
        serde_json::json!({ "proxies": all })
    }

    /// Refetch every provider now
    pub async fn update_providers(&self) -> Result<()> {
        self.providers.update_all().await
    }

    /// Stop every background loop
    pub async fn close(&self) {
        for group in self.groups() {
            if let Err(e) = group.close().await {
                warn!("close group {} error: {}", group.name(), e);
            }
        }
        self.providers.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
proxies:
  - { name: s1, type: socks5, server: 127.0.0.1, port: 1080 }
  - { name: h1, type: http, server: 127.0.0.1, port: 8080 }
proxy-groups:
  - { name: outer, type: select, proxies: [inner, DIRECT] }
  - { name: inner, type: fallback, proxies: [s1, h1], url: "http://127.0.0.1:1/generate_204", interval: 600 }
  - { name: lb, type: load-balance, proxies: [s1, h1], strategy: round-robin, url: "http://127.0.0.1:1/generate_204" }
"#;

    async fn build(yaml: &str) -> Result<OutboundManager> {
        let mut config = Config::from_str(yaml).unwrap();
        // never touch the host's resolver configuration
        config.dns.nameserver = vec!["127.0.0.1".to_string()];
        OutboundManager::new(&config).await
    }

    #[tokio::test]
    async fn test_builds_groups_over_groups() {
        let manager = build(CONFIG).await.unwrap();

        let names: Vec<_> = manager.groups().iter().map(|g| g.name().to_string()).collect();
        assert_eq!(names, vec!["outer", "inner", "lb"]);

        let outer = manager.group("outer").unwrap();
        assert_eq!(outer.all(), vec!["inner", "DIRECT"]);
        assert_eq!(outer.now(), "inner");

        manager.select("outer", "DIRECT").await.unwrap();
        assert_eq!(outer.now(), "DIRECT");
        assert!(manager.select("outer", "s1").await.is_err());
        assert!(manager.select("missing", "s1").await.is_err());

        // group providers are registered under the group's name
        assert!(manager.provider("inner").await.is_some());

        let status = manager.status();
        assert_eq!(status["proxies"]["lb"]["type"], "LoadBalance");
        assert_eq!(status["proxies"]["inner"]["now"], "s1");
        assert!(status["proxies"]["REJECT"].is_object());

        manager.close().await;
    }

    #[tokio::test]
    async fn test_rejects_bad_configs() {
        let unknown = r#"
proxy-groups:
  - { name: g, type: select, proxies: [nope] }
"#;
        assert!(build(unknown).await.is_err());

        let cycle = r#"
proxy-groups:
  - { name: a, type: select, proxies: [b] }
  - { name: b, type: select, proxies: [a] }
"#;
        match build(cycle).await {
            Err(Error::Config(msg)) => assert!(msg.contains("loop is detected")),
            _ => panic!("cycle not detected"),
        }

        let shadow = r#"
proxies:
  - { name: DIRECT, type: direct, server: "", port: 0 }
"#;
        assert!(build(shadow).await.is_err());
    }

    async fn verify(yaml: &str) -> Result<()> {
        let mut config = Config::from_str(yaml).unwrap();
        config.dns.nameserver = vec!["127.0.0.1".to_string()];
        OutboundManager::verify(&config).await
    }

    #[tokio::test]
    async fn test_verify_accepts_good_config() {
        verify(CONFIG).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_rejects_unknown_group_type() {
        let yaml = r#"
proxy-groups:
  - { name: g, type: round-robin, proxies: [DIRECT] }
"#;
        assert!(matches!(verify(yaml).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_verify_rejects_group_loop() {
        let yaml = r#"
proxy-groups:
  - { name: a, type: select, proxies: [b] }
  - { name: b, type: fallback, proxies: [a] }
"#;
        match verify(yaml).await {
            Err(Error::Config(msg)) => assert!(msg.contains("loop is detected")),
            other => panic!("loop accepted: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_verify_rejects_unknown_member() {
        let yaml = r#"
proxy-groups:
  - { name: g, type: select, proxies: [DIRECT, ghost] }
"#;
        match verify(yaml).await {
            Err(Error::Config(msg)) => assert!(msg.contains("ghost")),
            other => panic!("unknown member accepted: {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_verify_rejects_unknown_provider() {
        let yaml = r#"
proxy-groups:
  - { name: g, type: url-test, use: [nowhere] }
"#;
        match verify(yaml).await {
            Err(Error::Config(msg)) => assert!(msg.contains("nowhere")),
            other => panic!("unknown provider accepted: {:?}", other.err()),
        }
    }
}
