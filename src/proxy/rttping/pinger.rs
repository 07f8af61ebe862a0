//! Per-endpoint RTT prober and its smoothed estimate

use super::http2::Http2Session;
use super::RttPingConfig;
use crate::outbound::AnyProxy;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const RTT_ALPHA: f32 = 0.2;
const RTT_BETA: f32 = 0.25;

/// Prober state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum PingerStatus {
    Dead = 0,
    Pinging = 1,
    Idle = 2,
}

impl From<u32> for PingerStatus {
    fn from(v: u32) -> Self {
        match v {
            1 => PingerStatus::Pinging,
            2 => PingerStatus::Idle,
            _ => PingerStatus::Dead,
        }
    }
}

/// Smoothed RTT and mean deviation in milliseconds, TCP RTO style
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RttEstimator {
    pub latest: u32,
    pub srtt: u32,
    pub mean_deviation: u32,
    recorded: bool,
}

impl RttEstimator {
    /// Fold in one sample; the first one seeds `srtt = rtt`, `mdev = rtt / 2`.
    pub fn update(&mut self, rtt: u32) {
        if self.recorded {
            self.srtt = (self.srtt as f32 * (1.0 - RTT_ALPHA) + rtt as f32 * RTT_ALPHA) as u32;
            let deviation = (i64::from(self.srtt) - i64::from(rtt)).unsigned_abs() as f32;
            self.mean_deviation =
                (self.mean_deviation as f32 * (1.0 - RTT_BETA) + deviation * RTT_BETA) as u32;
        } else {
            self.srtt = rtt;
            self.mean_deviation = rtt / 2;
            self.recorded = true;
        }
        self.latest = rtt;
    }
}

/// Status entry exposed through the group's JSON
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingerSnapshot {
    pub name: String,
    pub status: PingerStatus,
    pub latest_rtt: u32,
    pub s_rtt: u32,
    pub mean_deviation: u32,
}

pub trait Pinger: Send + Sync {
    fn proxy(&self) -> &AnyProxy;

    /// Smoothed RTT in milliseconds, `u32::MAX` while dead
    fn smooth_rtt(&self) -> u32;

    fn snapshot(&self) -> PingerSnapshot;

    fn close(&self);
}

/// Keeps an HTTP/2 session open through one proxy and PINGs it every interval
pub struct Http2Pinger {
    config: Arc<RttPingConfig>,
    proxy: AnyProxy,
    status: AtomicU32,
    estimator: Mutex<RttEstimator>,
    token: CancellationToken,
}

impl Http2Pinger {
    pub fn new(config: Arc<RttPingConfig>, proxy: AnyProxy) -> Arc<Self> {
        Arc::new(Http2Pinger {
            config,
            proxy,
            status: AtomicU32::new(PingerStatus::Dead as u32),
            estimator: Mutex::new(RttEstimator::default()),
            token: CancellationToken::new(),
        })
    }

    /// New pinger with its loop already running
    pub fn spawn(config: Arc<RttPingConfig>, proxy: AnyProxy) -> Arc<Self> {
        let pinger = Self::new(config, proxy);
        let looping = pinger.clone();
        tokio::spawn(async move { looping.ping_loop().await });
        pinger
    }

    pub fn status(&self) -> PingerStatus {
        PingerStatus::from(self.status.load(Ordering::Acquire))
    }

    fn set_status(&self, status: PingerStatus) {
        self.status.store(status as u32, Ordering::Release);
    }

    pub(crate) fn record(&self, rtt: u32) {
        let mut estimator = self.estimator.lock();
        estimator.update(rtt);
        debug!(
            "[{}] rtt: {}, sRtt: {}, meanDeviation: {}",
            self.proxy.name(),
            rtt,
            estimator.srtt,
            estimator.mean_deviation
        );
        self.set_status(PingerStatus::Idle);
    }

    pub(crate) fn mark_dead(&self) {
        self.set_status(PingerStatus::Dead);
    }

    async fn ping(&self, session: &mut Http2Session) -> Result<()> {
        self.set_status(PingerStatus::Pinging);
        match tokio::time::timeout(self.config.interval, session.ping()).await {
            Ok(Ok(rtt)) => {
                self.record(rtt.as_millis().min(u128::from(u32::MAX - 1)) as u32);
                Ok(())
            }
            Ok(Err(e)) => {
                self.mark_dead();
                Err(e)
            }
            Err(_) => {
                self.mark_dead();
                Err(Error::timeout("http2 ping timed out"))
            }
        }
    }

    /// One session lifetime: dial, then ping until an error or close
    async fn session_round(&self) -> Result<()> {
        let handshake = tokio::time::timeout(
            self.config.interval * 5,
            Http2Session::connect(&self.proxy, &self.config.server),
        )
        .await;
        let mut session = match handshake {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.mark_dead();
                return Err(e);
            }
            Err(_) => {
                self.mark_dead();
                return Err(Error::timeout("http2 handshake timed out"));
            }
        };

        loop {
            if self.token.is_cancelled() {
                return Ok(());
            }
            self.ping(&mut session).await?;
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    async fn ping_loop(&self) {
        while !self.token.is_cancelled() {
            let result = tokio::select! {
                _ = self.token.cancelled() => break,
                result = self.session_round() => result,
            };
            if let Err(e) = result {
                debug!("[{}] ping loop error: {}, waiting for retry", self.proxy.name(), e);
            }
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval * 5) => {}
            }
        }
        debug!("[{}] ping loop stopped", self.proxy.name());
    }
}

impl Pinger for Http2Pinger {
    fn proxy(&self) -> &AnyProxy {
        &self.proxy
    }

    fn smooth_rtt(&self) -> u32 {
        match self.status() {
            PingerStatus::Dead => u32::MAX,
            PingerStatus::Pinging | PingerStatus::Idle => self.estimator.lock().srtt,
        }
    }

    fn snapshot(&self) -> PingerSnapshot {
        let estimator = *self.estimator.lock();
        PingerSnapshot {
            name: self.proxy.name().to_string(),
            status: self.status(),
            latest_rtt: estimator.latest,
            s_rtt: self.smooth_rtt(),
            mean_deviation: estimator.mean_deviation,
        }
    }

    fn close(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::mock;

    #[test]
    fn test_estimator_golden() {
        let mut est = RttEstimator::default();
        let mut got = Vec::new();
        for rtt in [100, 200, 150, 80, 300] {
            est.update(rtt);
            got.push((est.srtt, est.mean_deviation));
        }
        assert_eq!(got, vec![(100, 50), (120, 57), (126, 48), (116, 45), (152, 70)]);
        assert_eq!(est.latest, 300);
    }

    #[test]
    fn test_dead_reports_infinite_rtt() {
        let pinger = Http2Pinger::new(Arc::new(RttPingConfig::default()), mock("a"));
        assert_eq!(pinger.status(), PingerStatus::Dead);
        assert_eq!(pinger.smooth_rtt(), u32::MAX);

        pinger.record(40);
        assert_eq!(pinger.status(), PingerStatus::Idle);
        assert_eq!(pinger.smooth_rtt(), 40);

        pinger.mark_dead();
        assert_eq!(pinger.smooth_rtt(), u32::MAX);
        // the estimate survives a dead spell
        pinger.record(60);
        assert_eq!(pinger.smooth_rtt(), 44);
    }

    #[test]
    fn test_snapshot() {
        let pinger = Http2Pinger::new(Arc::new(RttPingConfig::default()), mock("a"));
        pinger.record(30);
        let json = serde_json::to_value(pinger.snapshot()).unwrap();
        assert_eq!(json["name"], "a");
        assert_eq!(json["status"], "idle");
        assert_eq!(json["sRtt"], 30);
        assert_eq!(json["meanDeviation"], 15);
    }

    #[tokio::test]
    async fn test_unreachable_server_marks_dead() {
        let config = RttPingConfig {
            interval: std::time::Duration::from_millis(50),
            ..RttPingConfig::default()
        };
        let (proxy, handle) = crate::testing::mock_with_handle("a");
        handle.set_fail(true);
        let pinger = Http2Pinger::spawn(Arc::new(config), proxy);

        for _ in 0..50 {
            if handle.dials() > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(handle.dials() > 0);
        assert_eq!(pinger.smooth_rtt(), u32::MAX);
        pinger.close();
    }
}
