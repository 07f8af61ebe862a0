//! Proxy providers: subscription/file backed sets and inline lists

use super::{
    Fetcher, HealthCheck, Initial, ProxyProvider, SubscriptionInfo, Vehicle, VehicleType,
};
use crate::config::ProxyConfig;
use crate::outbound::{build_adapter, AnyProxy, Proxy};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Deserialize)]
struct ProxySchema {
    proxies: Option<Vec<serde_yaml::Value>>,
}

/// Parse a provider payload (`proxies:` list), keeping entries whose name
/// matches one of `filters` (all entries when empty). Names are deduplicated;
/// protocols this build cannot dial are skipped.
pub fn parse_proxies(buf: &[u8], filters: &[Regex]) -> Result<Vec<AnyProxy>> {
    let schema: ProxySchema = serde_yaml::from_slice(buf)?;
    let mappings = schema
        .proxies
        .ok_or_else(|| Error::parse("file must have a `proxies` field"))?;

    let mut proxies = Vec::new();
    let mut seen = HashSet::new();
    let passes: Vec<Option<&Regex>> = if filters.is_empty() {
        vec![None]
    } else {
        filters.iter().map(Some).collect()
    };

    for filter in passes {
        for (idx, mapping) in mappings.iter().enumerate() {
            let Some(name) = mapping.get("name").and_then(|n| n.as_str()) else {
                continue;
            };
            if let Some(filter) = filter {
                if !filter.is_match(name) {
                    continue;
                }
            }
            if seen.contains(name) {
                continue;
            }

            let config: ProxyConfig = serde_yaml::from_value(mapping.clone())
                .map_err(|e| Error::parse(format!("proxy {} error: {}", idx, e)))?;
            config
                .validate()
                .map_err(|e| Error::parse(format!("proxy {} error: {}", idx, e)))?;
            let adapter = match build_adapter(&config) {
                Ok(adapter) => adapter,
                Err(Error::Unsupported(msg)) => {
                    warn!("skipping {}: {}", name, msg);
                    continue;
                }
                Err(e) => return Err(Error::parse(format!("proxy {} error: {}", idx, e))),
            };

            seen.insert(name.to_string());
            proxies.push(Proxy::new(adapter));
        }
    }

    if proxies.is_empty() {
        if !filters.is_empty() {
            return Err(Error::parse("doesn't match any proxy, please check your filter"));
        }
        return Err(Error::parse("file doesn't have any proxy"));
    }
    Ok(proxies)
}

struct SetState {
    proxies: RwLock<Vec<AnyProxy>>,
    version: AtomicU32,
    subscription_info: RwLock<Option<SubscriptionInfo>>,
}

impl SetState {
    fn apply(&self, proxies: Vec<AnyProxy>, hc: &Arc<HealthCheck>, vehicle: &Arc<dyn Vehicle>) {
        debug!("provider now has {} proxies", proxies.len());
        *self.proxies.write() = proxies.clone();
        self.version.fetch_add(1, Ordering::AcqRel);
        hc.set_proxies(proxies);
        if hc.auto() {
            let hc = hc.clone();
            tokio::spawn(async move { hc.lazy_check().await });
        }
        if let Some(info) = vehicle
            .subscription_userinfo()
            .and_then(|raw| SubscriptionInfo::parse(&raw))
        {
            *self.subscription_info.write() = Some(info);
        }
    }
}

/// Proxies loaded from a file or HTTP subscription
pub struct ProxySetProvider {
    name: String,
    fetcher: Arc<Fetcher<Vec<AnyProxy>>>,
    state: Arc<SetState>,
    health_check: Arc<HealthCheck>,
    token: CancellationToken,
}

impl ProxySetProvider {
    pub fn new(
        name: String,
        interval: Duration,
        vehicle: Arc<dyn Vehicle>,
        filters: Vec<Regex>,
        health_check: HealthCheck,
    ) -> Self {
        let parser = Box::new(move |buf: &[u8]| parse_proxies(buf, &filters));
        ProxySetProvider {
            fetcher: Arc::new(Fetcher::new(name.clone(), interval, vehicle, parser)),
            name,
            state: Arc::new(SetState {
                proxies: RwLock::new(Vec::new()),
                version: AtomicU32::new(0),
                subscription_info: RwLock::new(None),
            }),
            health_check: Arc::new(health_check),
            token: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl ProxyProvider for ProxySetProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn vehicle_type(&self) -> VehicleType {
        self.fetcher.vehicle_type()
    }

    fn proxies(&self) -> Vec<AnyProxy> {
        self.state.proxies.read().clone()
    }

    fn touch(&self) {
        self.health_check.touch();
    }

    fn version(&self) -> u32 {
        self.state.version.load(Ordering::Acquire)
    }

    async fn health_check(&self) {
        self.health_check.check().await;
    }

    async fn initial(&self) -> Result<()> {
        let Initial { value, stale } = self.fetcher.initial().await?;
        self.state
            .apply(value, &self.health_check, self.fetcher.vehicle());

        let state = self.state.clone();
        let hc = self.health_check.clone();
        let vehicle = self.fetcher.vehicle().clone();
        self.fetcher
            .start_pull_loop(self.token.child_token(), stale, move |proxies| {
                state.apply(proxies, &hc, &vehicle)
            });

        self.health_check.start();
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        if let Some(proxies) = self.fetcher.update().await? {
            self.state
                .apply(proxies, &self.health_check, self.fetcher.vehicle());
        }
        Ok(())
    }

    fn health_check_url(&self) -> String {
        self.health_check.url().to_string()
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.fetcher.updated_at()
    }

    fn subscription_info(&self) -> Option<SubscriptionInfo> {
        self.state.subscription_info.read().clone()
    }

    async fn close(&self) {
        self.token.cancel();
        self.health_check.close();
    }
}

/// A group's inline `proxies` list. Never changes, so its version stays 0.
pub struct CompatibleProvider {
    name: String,
    proxies: Vec<AnyProxy>,
    health_check: Arc<HealthCheck>,
}

impl CompatibleProvider {
    pub fn new(name: String, proxies: Vec<AnyProxy>, health_check: HealthCheck) -> Result<Self> {
        if proxies.is_empty() {
            return Err(Error::config("provider need one proxy at least"));
        }
        health_check.set_proxies(proxies.clone());
        Ok(CompatibleProvider {
            name,
            proxies,
            health_check: Arc::new(health_check),
        })
    }
}

#[async_trait]
impl ProxyProvider for CompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn vehicle_type(&self) -> VehicleType {
        VehicleType::Compatible
    }

    fn proxies(&self) -> Vec<AnyProxy> {
        self.proxies.clone()
    }

    fn touch(&self) {
        self.health_check.touch();
    }

    fn version(&self) -> u32 {
        0
    }

    async fn health_check(&self) {
        self.health_check.check().await;
    }

    async fn initial(&self) -> Result<()> {
        self.health_check.start();
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        Ok(())
    }

    fn health_check_url(&self) -> String {
        self.health_check.url().to_string()
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn subscription_info(&self) -> Option<SubscriptionInfo> {
        None
    }

    async fn close(&self) {
        self.health_check.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FileVehicle;
    use crate::testing::mock;
    use std::path::PathBuf;

    const V1: &str = r#"
proxies:
  - { name: A1, type: socks5, server: a1.example.com, port: 1080 }
  - { name: B1, type: http, server: b1.example.com, port: 8080 }
  - { name: A1, type: socks5, server: dup.example.com, port: 1080 }
  - { name: V1, type: vmess, server: v.example.com, port: 443 }
"#;

    fn idle_hc() -> HealthCheck {
        HealthCheck::new(String::new(), Duration::ZERO, true, false)
    }

    fn temp_file(name: &str, content: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join(format!("mihomo-groups-provider-{}-{}", std::process::id(), name));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("proxies.yaml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_parse_dedups_and_skips_unsupported() {
        let proxies = parse_proxies(V1.as_bytes(), &[]).unwrap();
        let names: Vec<_> = proxies.iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["A1", "B1"]);
        assert_eq!(proxies[0].addr(), "a1.example.com:1080");
    }

    #[test]
    fn test_parse_with_filters_orders_by_filter() {
        let filters = vec![Regex::new("^B").unwrap(), Regex::new("^A").unwrap()];
        let proxies = parse_proxies(V1.as_bytes(), &filters).unwrap();
        let names: Vec<_> = proxies.iter().map(|p| p.name().to_string()).collect();
        assert_eq!(names, vec!["B1", "A1"]);

        let none = vec![Regex::new("^Z").unwrap()];
        let err = parse_proxies(V1.as_bytes(), &none).err().unwrap();
        assert!(err.to_string().contains("filter"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_proxies(b"rules: []", &[]).is_err());
        assert!(parse_proxies(b"proxies: []", &[]).is_err());
        let bad_port = "proxies:\n  - { name: X, type: socks5, server: x.example.com }\n";
        let err = parse_proxies(bad_port.as_bytes(), &[]).err().unwrap();
        assert!(err.to_string().contains("proxy 0 error"));
    }

    #[tokio::test]
    async fn test_file_provider_version_tracks_content() {
        let path = temp_file("version", V1);
        let provider = ProxySetProvider::new(
            "sub".to_string(),
            Duration::ZERO,
            Arc::new(FileVehicle::new(&path)),
            Vec::new(),
            idle_hc(),
        );

        provider.initial().await.unwrap();
        assert_eq!(provider.version(), 1);
        assert_eq!(provider.proxies().len(), 2);
        assert!(provider.updated_at().is_some());

        provider.update().await.unwrap();
        assert_eq!(provider.version(), 1);

        std::fs::write(
            &path,
            "proxies:\n  - { name: C1, type: socks5, server: c.example.com, port: 1 }\n",
        )
        .unwrap();
        provider.update().await.unwrap();
        assert_eq!(provider.version(), 2);
        assert_eq!(provider.proxies()[0].name(), "C1");

        let json = provider.to_json();
        assert_eq!(json["vehicleType"], "File");
        assert_eq!(json["proxies"].as_array().unwrap().len(), 1);

        provider.close().await;
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_compatible_provider() {
        assert!(CompatibleProvider::new("g".into(), Vec::new(), idle_hc()).is_err());

        let provider =
            CompatibleProvider::new("g".into(), vec![mock("a"), mock("b")], idle_hc()).unwrap();
        assert_eq!(provider.vehicle_type(), VehicleType::Compatible);
        assert_eq!(provider.version(), 0);
        assert_eq!(provider.proxies_with_touch().len(), 2);
        assert!(provider.subscription_info().is_none());
    }
}
