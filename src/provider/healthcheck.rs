//! Periodic, bounded-concurrency latency probing of a provider's proxies

use crate::common::batch::{self, Batch};
use crate::outbound::{AnyProxy, DEFAULT_URL_TEST_TIMEOUT};
use crate::proxy::ExpectedStatus;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Probes in flight per round
const CHECK_CONCURRENCY: usize = 10;

/// Rounds requested within this window of the last one are skipped
const CHECK_COALESCE: Duration = Duration::from_secs(1);

/// Delay before the first scheduled round
const FIRST_CHECK_DELAY: Duration = Duration::from_secs(30);

pub struct HealthCheck {
    url: String,
    interval: Duration,
    lazy: bool,
    suspended: bool,
    expected_status: ExpectedStatus,
    proxies: RwLock<Vec<AnyProxy>>,
    last_touch: Mutex<Option<Instant>>,
    last_round: tokio::sync::Mutex<Option<Instant>>,
    token: CancellationToken,
}

impl HealthCheck {
    /// `interval` of zero disables scheduled rounds; forced rounds still work.
    pub fn new(url: String, interval: Duration, lazy: bool, suspended: bool) -> Self {
        HealthCheck {
            url,
            interval,
            lazy,
            suspended,
            expected_status: ExpectedStatus::default(),
            proxies: RwLock::new(Vec::new()),
            last_touch: Mutex::new(None),
            last_round: tokio::sync::Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    pub fn with_expected_status(mut self, expected: ExpectedStatus) -> Self {
        self.expected_status = expected;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether scheduled rounds run at all
    pub fn auto(&self) -> bool {
        !self.interval.is_zero()
    }

    pub fn set_proxies(&self, proxies: Vec<AnyProxy>) {
        *self.proxies.write() = proxies;
    }

    pub fn touch(&self) {
        *self.last_touch.lock() = Some(Instant::now());
    }

    /// Gate for one round.
    ///
    /// | forced | suspended | lazy | touched within interval | probe |
    /// |--------|-----------|------|-------------------------|-------|
    /// | yes    | any       | any  | any                     | yes   |
    /// | no     | yes       | any  | any                     | no    |
    /// | no     | no        | no   | any                     | yes   |
    /// | no     | no        | yes  | yes                     | yes   |
    /// | no     | no        | yes  | no                      | no    |
    pub fn should_probe(&self, forced: bool) -> bool {
        if forced {
            return true;
        }
        if self.suspended {
            return false;
        }
        if !self.lazy {
            return true;
        }
        match *self.last_touch.lock() {
            Some(at) => at.elapsed() < self.interval,
            None => false,
        }
    }

    /// Forced round: probe every proxy now, regardless of lazy or suspended.
    pub async fn check(&self) {
        self.round(true).await;
    }

    /// Scheduled round, skipped when the gate says so.
    pub async fn lazy_check(&self) {
        self.round(false).await;
    }

    async fn round(&self, forced: bool) {
        if !self.should_probe(forced) {
            return;
        }

        // callers queued behind a running round take its result
        let mut last_round = self.last_round.lock().await;
        if let Some(at) = *last_round {
            if at.elapsed() < CHECK_COALESCE {
                return;
            }
        }

        let proxies = self.proxies.read().clone();
        if proxies.is_empty() {
            return;
        }

        debug!("health check round over {} proxies ({})", proxies.len(), self.url);
        let mut batch: Batch<Option<u16>> = Batch::with_parent(CHECK_CONCURRENCY, &self.token);
        for proxy in proxies {
            let url = self.url.clone();
            let expected = self.expected_status.clone();
            batch.go(proxy.name().to_string(), move |token| async move {
                tokio::select! {
                    _ = token.cancelled() => Err(batch::cancelled()),
                    // failures are recorded in the proxy, not the round
                    result = proxy.url_test(&url, &expected, DEFAULT_URL_TEST_TIMEOUT) => Ok(result.ok()),
                }
            });
        }
        let result = batch.wait().await;
        let alive = result.values.values().filter(|d| d.is_some()).count();
        debug!(
            "health check round done: {}/{} alive",
            alive,
            result.values.len()
        );

        *last_round = Some(Instant::now());
    }

    /// Run scheduled rounds until `close`; no-op unless `auto()`. The first
    /// round, `FIRST_CHECK_DELAY` after start, is forced.
    pub fn start(self: &Arc<Self>) {
        if !self.auto() {
            return;
        }
        let hc = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = hc.token.cancelled() => return,
                _ = tokio::time::sleep(FIRST_CHECK_DELAY) => {}
            }
            // the first round runs even if nothing has touched the provider yet
            hc.check().await;

            let mut ticker = tokio::time::interval(hc.interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = hc.token.cancelled() => break,
                    _ = ticker.tick() => hc.lazy_check().await,
                }
            }
            debug!("health check loop for {} stopped", hc.url);
        });
    }

    pub fn close(&self) {
        self.token.cancel();
    }
}

impl Drop for HealthCheck {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
