//! Runtime proxy handle: adapter + liveness + delay history

use super::{ChainedDatagram, ChainedStream, Dialer, OutboundProxy, ProxyType};
use crate::common::{tls, Metadata};
use crate::proxy::ExpectedStatus;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use http_body_util::Empty;
use hyper::body::Bytes;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;
use url::Url;

/// Samples kept per proxy
pub const MAX_DELAY_HISTORY: usize = 10;

/// Per-probe deadline for URL tests
pub const DEFAULT_URL_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Reported by `last_delay` for a proxy that is dead or unmeasured
const UNUSABLE_DELAY: u16 = 0xffff;

#[derive(Debug, Clone, Serialize)]
pub struct DelayHistory {
    pub time: DateTime<Utc>,
    /// 0 marks a failed probe
    pub delay: u16,
}

pub type AnyProxy = Arc<Proxy>;

/// One egress as seen by groups: the adapter plus the telemetry used to rank it.
///
/// `alive` starts true, drops the moment a dial fails and only comes back
/// after a successful URL test.
pub struct Proxy {
    adapter: Arc<dyn OutboundProxy>,
    alive: AtomicBool,
    history: Mutex<VecDeque<DelayHistory>>,
}

impl Proxy {
    pub fn new(adapter: Arc<dyn OutboundProxy>) -> AnyProxy {
        Arc::new(Proxy {
            adapter,
            alive: AtomicBool::new(true),
            history: Mutex::new(VecDeque::with_capacity(MAX_DELAY_HISTORY)),
        })
    }

    pub fn adapter(&self) -> &Arc<dyn OutboundProxy> {
        &self.adapter
    }

    pub fn name(&self) -> &str {
        self.adapter.name()
    }

    pub fn proxy_type(&self) -> ProxyType {
        self.adapter.proxy_type()
    }

    pub fn addr(&self) -> String {
        self.adapter.addr()
    }

    pub fn support_udp(&self) -> bool {
        self.adapter.support_udp()
    }

    pub fn support_uot(&self) -> bool {
        self.adapter.support_uot()
    }

    pub fn support_with_dialer(&self) -> bool {
        self.adapter.support_with_dialer()
    }

    pub fn unwrap(&self, metadata: &Metadata, touch: bool) -> Option<AnyProxy> {
        self.adapter.unwrap(metadata, touch)
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::Release);
    }

    /// Last measured delay in ms, or 0xffff if dead, unmeasured or last probe failed
    pub fn last_delay(&self) -> u16 {
        if !self.alive() {
            return UNUSABLE_DELAY;
        }
        match self.history.lock().back() {
            Some(h) if h.delay > 0 => h.delay,
            _ => UNUSABLE_DELAY,
        }
    }

    pub fn delay_history(&self) -> Vec<DelayHistory> {
        self.history.lock().iter().cloned().collect()
    }

    /// Record a probe outcome; `None` is a failure
    pub fn record_delay(&self, delay: Option<u16>) {
        self.set_alive(delay.is_some());

        let mut history = self.history.lock();
        history.push_back(DelayHistory {
            time: Utc::now(),
            delay: delay.unwrap_or(0),
        });
        while history.len() > MAX_DELAY_HISTORY {
            history.pop_front();
        }
    }

    pub async fn dial_tcp(&self, metadata: &Metadata) -> Result<ChainedStream> {
        let result = self.adapter.dial_tcp(metadata).await;
        self.finish_dial(result)
    }

    pub async fn dial_tcp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedStream> {
        let result = self.adapter.dial_tcp_with_dialer(dialer, metadata).await;
        self.finish_dial(result)
    }

    fn finish_dial(&self, result: Result<ChainedStream>) -> Result<ChainedStream> {
        match result {
            Ok(mut stream) => {
                stream.append_to_chains(self.name());
                Ok(stream)
            }
            Err(e) => {
                if e.is_dial_error() {
                    self.set_alive(false);
                }
                Err(e)
            }
        }
    }

    pub async fn listen_udp(&self, metadata: &Metadata) -> Result<ChainedDatagram> {
        let result = self.adapter.listen_udp(metadata).await;
        self.finish_listen(result)
    }

    pub async fn listen_udp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedDatagram> {
        let result = self.adapter.listen_udp_with_dialer(dialer, metadata).await;
        self.finish_listen(result)
    }

    fn finish_listen(&self, result: Result<ChainedDatagram>) -> Result<ChainedDatagram> {
        match result {
            Ok(mut pc) => {
                pc.append_to_chains(self.name());
                Ok(pc)
            }
            Err(e) => {
                if e.is_dial_error() {
                    self.set_alive(false);
                }
                Err(e)
            }
        }
    }

    /// HEAD `url` through this proxy; records the outcome in the delay history
    pub async fn url_test(
        &self,
        url: &str,
        expected: &ExpectedStatus,
        timeout: Duration,
    ) -> Result<u16> {
        let result = match tokio::time::timeout(timeout, self.probe(url, expected)).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(format!("url test via {} timed out", self.name()))),
        };

        match &result {
            Ok(delay) => self.record_delay(Some(*delay)),
            Err(e) => {
                debug!("[{}] url test {} failed: {}", self.name(), url, e);
                self.record_delay(None);
            }
        }
        result
    }

    async fn probe(&self, url: &str, expected: &ExpectedStatus) -> Result<u16> {
        let target = Url::parse(url).map_err(|e| Error::config(format!("bad test url {}: {}", url, e)))?;
        let host = target
            .host_str()
            .ok_or_else(|| Error::config(format!("test url {} has no host", url)))?;
        let port = target
            .port_or_known_default()
            .ok_or_else(|| Error::config(format!("test url {} has no port", url)))?;
        let metadata = Metadata::from_addr(&format!("{}:{}", host, port))?;

        let start = Instant::now();
        let stream = self.dial_tcp(&metadata).await?;
        let status = if target.scheme() == "https" {
            let config = tls::client_config(false, &[b"http/1.1"]);
            let sni = host.trim_start_matches('[').trim_end_matches(']');
            let tls_stream = tls::connect(config, sni, stream).await?;
            head_request(tls_stream, &target).await?
        } else {
            head_request(stream, &target).await?
        };

        if !expected.matches(status) {
            return Err(Error::proxy(format!("unexpected status code {}", status)));
        }

        // 0 is the failure marker in the history
        let elapsed = start.elapsed().as_millis().clamp(1, (UNUSABLE_DELAY - 1) as u128);
        Ok(elapsed as u16)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name(),
            "type": self.proxy_type().to_string(),
            "udp": self.support_udp(),
            "alive": self.alive(),
            "history": self.delay_history(),
        })
    }

    pub async fn close(&self) -> Result<()> {
        self.adapter.close().await
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("name", &self.name())
            .field("type", &self.proxy_type())
            .field("alive", &self.alive())
            .finish()
    }
}

async fn head_request<S>(io: S, target: &Url) -> Result<u16>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("url test connection closed: {}", e);
        }
    });

    let authority = match target.port() {
        Some(port) => format!("{}:{}", target.host_str().unwrap_or_default(), port),
        None => target.host_str().unwrap_or_default().to_string(),
    };
    let path = match target.query() {
        Some(q) => format!("{}?{}", target.path(), q),
        None => target.path().to_string(),
    };

    let request = http::Request::builder()
        .method(http::Method::HEAD)
        .uri(path)
        .header(http::header::HOST, authority)
        .header(http::header::USER_AGENT, concat!("mihomo-groups/", env!("CARGO_PKG_VERSION")))
        .body(Empty::<Bytes>::new())
        .map_err(|e| Error::protocol(e.to_string()))?;

    let response = sender.send_request(request).await?;
    Ok(response.status().as_u16())
}
