//! Candidate aggregation and dial-failure tracking shared by all groups

use super::{ExpectedStatus, GroupOption};
use crate::common::batch::Batch;
use crate::common::Metadata;
use crate::outbound::{
    AnyProxy, ChainedStream, Dialer, Direct, Proxy, DEFAULT_URL_TEST_TIMEOUT,
};
use crate::provider::{ProxyProvider, VehicleType};
use crate::{Error, Result};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Failures within this window count towards an active health check
const FAILED_WINDOW: Duration = Duration::from_secs(5);
const MAX_FAILED_TIMES: u32 = 5;
const URL_TEST_CONCURRENCY: usize = 16;

struct CachedSlice {
    version: u32,
    proxies: Vec<AnyProxy>,
}

#[derive(Default)]
struct FailedState {
    times: u32,
    first: Option<Instant>,
}

struct FailureTracker {
    state: Mutex<FailedState>,
    testing: AtomicBool,
}

pub struct GroupBase {
    name: String,
    providers: Vec<Arc<dyn ProxyProvider>>,
    filter: Option<Regex>,
    // one slot per provider, in provider order
    cache: Mutex<Vec<Option<CachedSlice>>>,
    failures: Arc<FailureTracker>,
    compatible: AnyProxy,
    test_url: String,
    expected_status: ExpectedStatus,
    hidden: bool,
    icon: String,
}

impl GroupBase {
    pub fn new(option: &GroupOption, providers: Vec<Arc<dyn ProxyProvider>>) -> Result<Self> {
        let filter = match &option.filter {
            Some(f) => Some(
                Regex::new(f).map_err(|e| Error::config(format!("invalid filter regex: {}", e)))?,
            ),
            None => None,
        };
        let cache = (0..providers.len()).map(|_| None).collect();

        Ok(GroupBase {
            name: option.name.clone(),
            providers,
            filter,
            cache: Mutex::new(cache),
            failures: Arc::new(FailureTracker {
                state: Mutex::new(FailedState::default()),
                testing: AtomicBool::new(false),
            }),
            compatible: Proxy::new(Arc::new(Direct::compatible())),
            test_url: option.url.clone(),
            expected_status: option.expected_status.clone(),
            hidden: option.hidden,
            icon: option.icon.clone().unwrap_or_default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn providers(&self) -> &[Arc<dyn ProxyProvider>] {
        &self.providers
    }

    pub fn test_url(&self) -> &str {
        &self.test_url
    }

    pub fn hidden(&self) -> bool {
        self.hidden
    }

    pub fn icon(&self) -> &str {
        &self.icon
    }

    pub fn touch(&self) {
        for p in &self.providers {
            p.touch();
        }
    }

    /// Every candidate across providers, never empty.
    ///
    /// With a filter, a provider's filtered slice is recomputed only when its
    /// version moved; inline (compatible) providers are taken as they are.
    pub fn get_proxies(&self, touch: bool) -> Vec<AnyProxy> {
        let mut proxies = Vec::new();

        match &self.filter {
            None => {
                for pd in &self.providers {
                    if touch {
                        pd.touch();
                    }
                    proxies.extend(pd.proxies());
                }
            }
            Some(filter) => {
                let mut cache = self.cache.lock();
                for (pd, slot) in self.providers.iter().zip(cache.iter_mut()) {
                    if touch {
                        pd.touch();
                    }

                    if pd.vehicle_type() == VehicleType::Compatible {
                        proxies.extend(pd.proxies());
                        continue;
                    }

                    let version = pd.version();
                    let stale = slot.as_ref().map_or(true, |s| s.version != version);
                    if stale {
                        debug!("[{}] refiltering provider {} at version {}", self.name, pd.name(), version);
                        let filtered = pd
                            .proxies()
                            .into_iter()
                            .filter(|p| filter.is_match(p.name()))
                            .collect();
                        *slot = Some(CachedSlice {
                            version,
                            proxies: filtered,
                        });
                    }
                    if let Some(slot) = slot {
                        proxies.extend(slot.proxies.iter().cloned());
                    }
                }
            }
        }

        if proxies.is_empty() {
            proxies.push(self.compatible.clone());
        }
        proxies
    }

    /// Probe every candidate concurrently; errors only if none answered.
    pub async fn url_test(&self, url: &str, expected: &ExpectedStatus) -> Result<HashMap<String, u16>> {
        let mut batch: Batch<u16> = Batch::new(URL_TEST_CONCURRENCY);
        for proxy in self.get_proxies(false) {
            let url = url.to_string();
            let expected = expected.clone();
            batch.go(proxy.name().to_string(), move |_| async move {
                proxy.url_test(&url, &expected, DEFAULT_URL_TEST_TIMEOUT).await
            });
        }

        let result = batch.wait().await;
        if result.values.is_empty() {
            return Err(Error::timeout("get delay: all proxies timeout"));
        }
        Ok(result.values)
    }

    pub fn expected_status(&self) -> &ExpectedStatus {
        &self.expected_status
    }

    pub(crate) async fn dial_via(
        &self,
        proxy: &AnyProxy,
        dialer: Option<Arc<dyn Dialer>>,
        metadata: &Metadata,
    ) -> Result<ChainedStream> {
        let result = match dialer {
            Some(dialer) => proxy.dial_tcp_with_dialer(dialer, metadata).await,
            None => proxy.dial_tcp(metadata).await,
        };
        match &result {
            Ok(_) => self.on_dial_success(),
            Err(e) => {
                debug!("[{}] dial via {} failed: {}", self.name, proxy.name(), e);
                self.on_dial_failed();
            }
        }
        result
    }

    /// Count a failed dial; enough of them in a short window trigger a
    /// health check of every provider.
    pub fn on_dial_failed(&self) {
        if self.failures.testing.load(Ordering::Acquire) {
            return;
        }

        let providers = {
            let mut state = self.failures.state.lock();
            state.times += 1;
            if state.times == 1 {
                debug!("[{}] first failed", self.name);
                state.first = Some(Instant::now());
                return;
            }
            if state.first.map_or(true, |at| at.elapsed() > FAILED_WINDOW) {
                state.times = 0;
                return;
            }
            debug!("[{}] failed count: {}", self.name, state.times);
            if state.times < MAX_FAILED_TIMES {
                return;
            }
            if self.failures.testing.swap(true, Ordering::AcqRel) {
                return;
            }
            self.providers.clone()
        };

        warn!("because {} failed multiple times, active health check", self.name);
        let failures = self.failures.clone();
        tokio::spawn(async move {
            let checks: Vec<_> = providers
                .iter()
                .map(|pd| {
                    let pd = pd.clone();
                    tokio::spawn(async move { pd.health_check().await })
                })
                .collect();
            for check in checks {
                let _ = check.await;
            }
            failures.state.lock().times = 0;
            failures.testing.store(false, Ordering::Release);
        });
    }

    pub fn on_dial_success(&self) {
        if !self.failures.testing.load(Ordering::Acquire) {
            self.failures.state.lock().times = 0;
        }
    }

    #[cfg(test)]
    pub(crate) fn failed_times(&self) -> u32 {
        self.failures.state.lock().times
    }
}
