//! Proxy Groups (Selector, URLTest, Fallback, LoadBalance, Relay, HTTP/2 ping)
//!
//! Every group is an `OutboundProxy` itself, so rules and other groups dial
//! it like any concrete proxy. Candidates come from `GroupBase`, which
//! aggregates the group's providers.

mod fallback;
mod group_base;
mod loadbalance;
mod parser;
mod relay;
pub mod rttping;
mod selector;
mod urltest;

pub use fallback::Fallback;
pub use group_base::GroupBase;
pub use loadbalance::{jump_hash, routing_key, LoadBalance, Strategy};
pub use parser::{parse_proxy_group, sort_groups, GroupContext, ParsedGroup};
pub use relay::Relay;
pub use rttping::RttPing;
pub use selector::Selector;
pub use urltest::{select_fast, URLTest};

use crate::config::ProxyGroupConfig;
use crate::outbound::{AnyProxy, OutboundProxy, ProxyType};
use crate::provider::ProxyProvider;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Default test URL
pub const DEFAULT_TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Window of the memoized member pick (Selector) and member list (Relay)
pub const GET_PROXIES_CACHE: Duration = Duration::from_secs(5);

/// Type of proxy group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    Selector,
    URLTest,
    Fallback,
    LoadBalance,
    Relay,
    Http2Ping,
}

impl GroupType {
    pub fn proxy_type(&self) -> ProxyType {
        match self {
            GroupType::Selector => ProxyType::Selector,
            GroupType::URLTest => ProxyType::URLTest,
            GroupType::Fallback => ProxyType::Fallback,
            GroupType::LoadBalance => ProxyType::LoadBalance,
            GroupType::Relay => ProxyType::Relay,
            GroupType::Http2Ping => ProxyType::Http2Ping,
        }
    }
}

impl std::fmt::Display for GroupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupType::Selector => write!(f, "Selector"),
            GroupType::URLTest => write!(f, "URLTest"),
            GroupType::Fallback => write!(f, "Fallback"),
            GroupType::LoadBalance => write!(f, "LoadBalance"),
            GroupType::Relay => write!(f, "Relay"),
            GroupType::Http2Ping => write!(f, "Http2Ping"),
        }
    }
}

impl TryFrom<&str> for GroupType {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s {
            "select" => Ok(GroupType::Selector),
            "url-test" => Ok(GroupType::URLTest),
            "fallback" => Ok(GroupType::Fallback),
            "load-balance" => Ok(GroupType::LoadBalance),
            "relay" => Ok(GroupType::Relay),
            "http2ping" => Ok(GroupType::Http2Ping),
            other => Err(Error::config(format!("unsupport type: {}", other))),
        }
    }
}

/// Expected HTTP status for URL test
#[derive(Debug, Clone)]
pub struct ExpectedStatus {
    pub codes: Vec<u16>,
}

impl ExpectedStatus {
    pub fn new(codes: Vec<u16>) -> Self {
        ExpectedStatus { codes }
    }

    /// Parse `200/204`, `200-299` or `*`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(ExpectedStatus::new(Vec::new()));
        }

        let bad = || Error::config(format!("invalid expected-status: {}", s));
        let mut codes = Vec::new();
        for part in s.split('/') {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u16 = lo.trim().parse().map_err(|_| bad())?;
                    let hi: u16 = hi.trim().parse().map_err(|_| bad())?;
                    if lo > hi {
                        return Err(bad());
                    }
                    codes.extend(lo..=hi);
                }
                None => codes.push(part.trim().parse().map_err(|_| bad())?),
            }
        }
        Ok(ExpectedStatus::new(codes))
    }

    pub fn matches(&self, status: u16) -> bool {
        self.codes.is_empty() || self.codes.contains(&status)
    }
}

impl Default for ExpectedStatus {
    fn default() -> Self {
        ExpectedStatus { codes: vec![200, 204, 301, 302] }
    }
}

/// Administrative surface shared by all groups
#[async_trait]
pub trait ProxyGroup: OutboundProxy {
    fn base(&self) -> &GroupBase;

    fn group_type(&self) -> GroupType;

    /// Name of the proxy the next dial would use
    fn now(&self) -> String;

    /// Candidate set
    fn proxies(&self, touch: bool) -> Vec<AnyProxy> {
        self.base().get_proxies(touch)
    }

    fn all(&self) -> Vec<String> {
        self.proxies(false)
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Select `name`; fails unless it is in the current set
    async fn set(&self, name: &str) -> Result<()> {
        Err(Error::unsupported(format!(
            "{} does not support manual selection of {}",
            self.name(),
            name
        )))
    }

    /// Select `name` without validation
    fn force_set(&self, _name: &str) {}

    /// Manually pinned proxy, if any
    fn fixed(&self) -> Option<String> {
        None
    }

    fn providers(&self) -> &[Arc<dyn ProxyProvider>] {
        self.base().providers()
    }

    fn test_url(&self) -> &str {
        self.base().test_url()
    }

    /// Probe every candidate now
    async fn url_test(&self, url: &str, expected: &ExpectedStatus) -> Result<HashMap<String, u16>> {
        self.base().url_test(url, expected).await
    }

    fn touch(&self) {
        self.base().touch();
    }

    fn to_json(&self) -> serde_json::Value {
        let base = self.base();
        serde_json::json!({
            "name": self.name(),
            "type": self.group_type().to_string(),
            "now": self.now(),
            "all": self.all(),
            "testUrl": base.test_url(),
            "fixed": self.fixed().unwrap_or_default(),
            "hidden": base.hidden(),
            "icon": base.icon(),
            "udp": self.support_udp(),
        })
    }
}

/// Group option from configuration
#[derive(Debug, Clone)]
pub struct GroupOption {
    pub name: String,
    pub group_type: GroupType,
    pub proxies: Vec<String>,
    pub use_providers: Vec<String>,
    pub url: String,
    /// Seconds; milliseconds for the ping group
    pub interval: u64,
    /// Milliseconds
    pub tolerance: u64,
    pub lazy: bool,
    pub disable_udp: bool,
    pub filter: Option<String>,
    pub strategy: Option<String>,
    pub server: Option<String>,
    pub hidden: bool,
    pub icon: Option<String>,
    pub expected_status: ExpectedStatus,
    /// Skip scheduled health checks
    pub suspended: bool,
}

impl GroupOption {
    pub fn from_config(config: &ProxyGroupConfig, suspended: bool) -> Result<Self> {
        config.validate()?;
        let group_type = GroupType::try_from(config.group_type.as_str())?;
        Ok(GroupOption {
            name: config.name.clone(),
            group_type,
            proxies: config.proxies.clone(),
            use_providers: config.use_providers.clone(),
            url: config
                .url
                .clone()
                .filter(|u| !u.is_empty())
                .unwrap_or_else(|| DEFAULT_TEST_URL.to_string()),
            interval: config.interval.unwrap_or(0),
            tolerance: config.tolerance.unwrap_or(0),
            lazy: config.lazy,
            disable_udp: config.disable_udp,
            filter: config.filter.clone().filter(|f| !f.is_empty()),
            strategy: config.strategy.clone(),
            server: config.server.clone(),
            hidden: config.hidden,
            icon: config.icon.clone(),
            expected_status: match config.expected_status.as_deref() {
                Some(s) => ExpectedStatus::parse(s)?,
                None => ExpectedStatus::default(),
            },
            suspended,
        })
    }
}

impl Default for GroupOption {
    fn default() -> Self {
        GroupOption {
            name: String::new(),
            group_type: GroupType::Selector,
            proxies: Vec::new(),
            use_providers: Vec::new(),
            url: DEFAULT_TEST_URL.to_string(),
            interval: 300,
            tolerance: 0,
            lazy: true,
            disable_udp: false,
            filter: None,
            strategy: None,
            server: None,
            hidden: false,
            icon: None,
            expected_status: ExpectedStatus::default(),
            suspended: false,
        }
    }
}
