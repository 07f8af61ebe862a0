//! Proxy providers
//!
//! A provider owns a refreshable list of proxies and bumps its version each
//! time that list actually changes. `ProxySetProvider` loads from a file or
//! an HTTP subscription; `CompatibleProvider` wraps a group's inline list.

mod fetcher;
mod healthcheck;
mod proxy;

pub use fetcher::{FileVehicle, Fetcher, HttpVehicle, Initial, Parser, Vehicle};
pub use healthcheck::HealthCheck;
pub use proxy::{parse_proxies, CompatibleProvider, ProxySetProvider};

use crate::config::ProxyProviderConfig;
use crate::outbound::AnyProxy;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Vehicle type (how data is loaded)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VehicleType {
    HTTP,
    File,
    Compatible,
}

impl std::fmt::Display for VehicleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VehicleType::HTTP => write!(f, "HTTP"),
            VehicleType::File => write!(f, "File"),
            VehicleType::Compatible => write!(f, "Compatible"),
        }
    }
}

/// Subscription information parsed from headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SubscriptionInfo {
    /// Upload bytes used
    pub upload: u64,
    /// Download bytes used
    pub download: u64,
    /// Total bytes available
    pub total: u64,
    /// Expiration timestamp (Unix epoch)
    pub expire: u64,
}

impl SubscriptionInfo {
    /// Parse from Subscription-Userinfo header
    ///
    /// Format: "upload=xxx; download=xxx; total=xxx; expire=xxx"
    pub fn parse(header: &str) -> Option<Self> {
        let mut info = SubscriptionInfo {
            upload: 0,
            download: 0,
            total: 0,
            expire: 0,
        };
        let mut seen = false;

        for part in header.split(';') {
            let part = part.trim();
            if let Some((key, value)) = part.split_once('=') {
                // some panels report fractional byte counts
                let value = value.trim();
                let value = value
                    .parse::<u64>()
                    .or_else(|_| value.parse::<f64>().map(|v| v.max(0.0) as u64))
                    .unwrap_or(0);
                match key.trim().to_lowercase().as_str() {
                    "upload" => info.upload = value,
                    "download" => info.download = value,
                    "total" => info.total = value,
                    "expire" => info.expire = value,
                    _ => continue,
                }
                seen = true;
            }
        }

        seen.then_some(info)
    }
}

/// Trait for proxy providers
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    fn name(&self) -> &str;

    fn vehicle_type(&self) -> VehicleType;

    /// Current proxies, in source order
    fn proxies(&self) -> Vec<AnyProxy>;

    /// Mark the provider as in use so lazy health checks keep running
    fn touch(&self);

    fn proxies_with_touch(&self) -> Vec<AnyProxy> {
        self.touch();
        self.proxies()
    }

    /// Bumped every time the proxy list changes
    fn version(&self) -> u32;

    /// Probe every proxy now
    async fn health_check(&self);

    /// Initial load; starts background refresh and health checking
    async fn initial(&self) -> Result<()>;

    /// Fetch from source now
    async fn update(&self) -> Result<()>;

    fn health_check_url(&self) -> String;

    fn updated_at(&self) -> Option<DateTime<Utc>>;

    /// Subscription info (for HTTP providers)
    fn subscription_info(&self) -> Option<SubscriptionInfo>;

    fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "type": "Proxy",
            "vehicleType": self.vehicle_type().to_string(),
            "proxies": self.proxies().iter().map(|p| p.to_json()).collect::<Vec<_>>(),
            "testUrl": self.health_check_url(),
            "updatedAt": self.updated_at(),
            "subscriptionInfo": self.subscription_info(),
        })
    }

    /// Stop background tasks
    async fn close(&self);
}

/// Build a file or HTTP provider from its configuration entry
pub fn build_provider(
    name: &str,
    config: &ProxyProviderConfig,
    suspended: bool,
) -> Result<Arc<ProxySetProvider>> {
    config.validate(name)?;

    let vehicle: Arc<dyn Vehicle> = match config.provider_type.as_str() {
        "http" => Arc::new(HttpVehicle::new(
            config.url.clone().unwrap_or_default(),
            config.path.clone(),
        )?),
        "file" => Arc::new(FileVehicle::new(config.path.clone())),
        other => return Err(Error::config(format!("unsupported vehicle type: {}", other))),
    };

    let filter = match config.filter.as_deref().filter(|f| !f.is_empty()) {
        Some(filter) => filter
            .split('`')
            .map(Regex::new)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::config(format!("provider {}: invalid filter regex: {}", name, e)))?,
        None => Vec::new(),
    };

    let hc_config = &config.health_check;
    let hc_interval = if hc_config.enable {
        Duration::from_secs(hc_config.interval)
    } else {
        Duration::ZERO
    };
    let hc = HealthCheck::new(hc_config.url.clone(), hc_interval, hc_config.lazy, suspended);

    Ok(Arc::new(ProxySetProvider::new(
        name.to_string(),
        Duration::from_secs(config.interval),
        vehicle,
        filter,
        hc,
    )))
}

/// Provider manager holding all providers
pub struct ProviderManager {
    proxy_providers: RwLock<HashMap<String, Arc<dyn ProxyProvider>>>,
}

impl ProviderManager {
    pub fn new() -> Self {
        ProviderManager {
            proxy_providers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_proxy_provider(&self, provider: Arc<dyn ProxyProvider>) {
        let name = provider.name().to_string();
        self.proxy_providers.write().await.insert(name, provider);
    }

    pub async fn get_proxy_provider(&self, name: &str) -> Option<Arc<dyn ProxyProvider>> {
        self.proxy_providers.read().await.get(name).cloned()
    }

    /// Update all providers
    pub async fn update_all(&self) -> Result<()> {
        for (_, provider) in self.proxy_providers.read().await.iter() {
            if let Err(e) = provider.update().await {
                tracing::warn!("Failed to update proxy provider {}: {}", provider.name(), e);
            }
        }
        Ok(())
    }

    /// Close all providers
    pub async fn close_all(&self) {
        for (_, provider) in self.proxy_providers.read().await.iter() {
            provider.close().await;
        }
    }
}

impl Default for ProviderManager {
    fn default() -> Self {
        Self::new()
    }
}
