//! Configuration module

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level
    #[serde(rename = "log-level")]
    pub log_level: String,

    /// Skip scheduled health checks (forced checks still run)
    pub suspended: bool,

    /// DNS configuration
    pub dns: DnsConfig,

    /// Proxy definitions
    pub proxies: Vec<ProxyConfig>,

    /// Proxy providers, keyed by name
    #[serde(rename = "proxy-providers")]
    pub proxy_providers: HashMap<String, ProxyProviderConfig>,

    /// Proxy groups
    #[serde(rename = "proxy-groups")]
    pub proxy_groups: Vec<ProxyGroupConfig>,
}

impl Config {
    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();

        for proxy in &self.proxies {
            proxy.validate()?;
            if !names.insert(proxy.name.as_str()) {
                return Err(Error::config(format!("duplicate proxy name: {}", proxy.name)));
            }
        }

        for group in &self.proxy_groups {
            group.validate()?;
            if !names.insert(group.name.as_str()) {
                return Err(Error::config(format!(
                    "duplicate proxy or group name: {}",
                    group.name
                )));
            }
        }

        for (name, provider) in &self.proxy_providers {
            provider.validate(name)?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: "info".to_string(),
            suspended: false,
            dns: DnsConfig::default(),
            proxies: Vec::new(),
            proxy_providers: HashMap::new(),
            proxy_groups: Vec::new(),
        }
    }
}

/// DNS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Upstream nameservers; empty means the system configuration
    pub nameserver: Vec<String>,

    /// Also query AAAA records
    pub ipv6: bool,

    /// Static overrides
    pub hosts: HashMap<String, String>,

    /// Cache size
    #[serde(rename = "cache-size")]
    pub cache_size: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        DnsConfig {
            nameserver: Vec::new(),
            ipv6: false,
            hosts: HashMap::new(),
            cache_size: 4096,
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Proxy name
    pub name: String,

    /// Proxy type
    #[serde(rename = "type")]
    pub proxy_type: String,

    /// Server address
    #[serde(default)]
    pub server: String,

    /// Server port
    #[serde(default)]
    pub port: u16,

    /// All other fields
    #[serde(flatten)]
    pub extra: HashMap<String, serde_yaml::Value>,
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::config("Proxy name cannot be empty"));
        }
        let serverless = matches!(
            self.proxy_type.to_lowercase().as_str(),
            "direct" | "reject" | "reject-drop"
        );
        if !serverless {
            if self.server.is_empty() {
                return Err(Error::config(format!("proxy {}: server cannot be empty", self.name)));
            }
            if self.port == 0 {
                return Err(Error::config(format!("proxy {}: port cannot be 0", self.name)));
            }
        }
        Ok(())
    }

    /// Get string field
    pub fn get_string(&self, key: &str) -> Option<String> {
        self.extra.get(key).and_then(|v| v.as_str()).map(String::from)
    }

    /// Get bool field
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.extra.get(key).and_then(|v| v.as_bool())
    }
}

/// Provider health check settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enable: bool,
    pub url: String,
    /// Seconds between rounds
    pub interval: u64,
    pub lazy: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        HealthCheckConfig {
            enable: false,
            url: crate::proxy::DEFAULT_TEST_URL.to_string(),
            interval: 300,
            lazy: true,
        }
    }
}

/// Proxy provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyProviderConfig {
    /// `http` or `file`
    #[serde(rename = "type")]
    pub provider_type: String,

    #[serde(default)]
    pub url: Option<String>,

    /// Local cache file (http) or source file (file)
    pub path: String,

    /// Seconds between refreshes; 0 disables the pull loop
    #[serde(default)]
    pub interval: u64,

    /// Regex over proxy names applied when the provider parses its payload
    #[serde(default)]
    pub filter: Option<String>,

    #[serde(default, rename = "health-check")]
    pub health_check: HealthCheckConfig,
}

impl ProxyProviderConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        match self.provider_type.as_str() {
            "http" => {
                if self.url.as_deref().unwrap_or_default().is_empty() {
                    return Err(Error::config(format!("provider {}: missing url", name)));
                }
            }
            "file" => {}
            other => {
                return Err(Error::config(format!(
                    "provider {}: unsupported vehicle type {}",
                    name, other
                )))
            }
        }
        if self.path.is_empty() {
            return Err(Error::config(format!("provider {}: missing path", name)));
        }
        Ok(())
    }
}

/// Proxy group configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyGroupConfig {
    /// Group name
    pub name: String,

    /// `select`, `url-test`, `fallback`, `load-balance`, `relay` or `http2ping`
    #[serde(rename = "type")]
    pub group_type: String,

    /// Proxies or other groups, by name
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Providers, by name
    #[serde(default, rename = "use")]
    pub use_providers: Vec<String>,

    /// URL for testing
    pub url: Option<String>,

    /// Test interval (seconds; milliseconds for http2ping)
    pub interval: Option<u64>,

    /// Tolerance (milliseconds)
    pub tolerance: Option<u64>,

    #[serde(default = "default_true")]
    pub lazy: bool,

    #[serde(default, rename = "disable-udp")]
    pub disable_udp: bool,

    /// Regex over proxy names
    pub filter: Option<String>,

    /// Load-balance strategy
    pub strategy: Option<String>,

    /// HTTP/2 ping endpoint
    pub server: Option<String>,

    #[serde(default)]
    pub hidden: bool,

    pub icon: Option<String>,

    /// Accepted URL test status codes, e.g. `204` or `200-299/302`; `*` accepts any
    #[serde(default, rename = "expected-status")]
    pub expected_status: Option<String>,
}

impl ProxyGroupConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.group_type.is_empty() {
            return Err(Error::config("proxy group needs a name and a type"));
        }
        if self.proxies.is_empty() && self.use_providers.is_empty() {
            return Err(Error::config(format!(
                "group {}: `use` or `proxies` missing",
                self.name
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
