//! Scriptable adapter for unit tests

use crate::common::Metadata;
use crate::outbound::{
    AnyProxy, ChainedDatagram, ChainedStream, Dialer, OutboundProxy, Proxy, ProxyType,
};
use crate::provider::{ProxyProvider, SubscriptionInfo, VehicleType};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct MockProxy {
    name: String,
    proxy_type: ProxyType,
    addr: String,
    udp: bool,
    uot: bool,
    with_dialer: bool,
    fail: AtomicBool,
    dials: AtomicUsize,
    udp_opens: AtomicUsize,
    next: Mutex<Option<AnyProxy>>,
}

impl MockProxy {
    pub fn new(name: &str) -> Self {
        MockProxy {
            name: name.to_string(),
            proxy_type: ProxyType::Socks5,
            addr: format!("{}.example.com:443", name.to_lowercase()),
            udp: true,
            uot: false,
            with_dialer: true,
            fail: AtomicBool::new(false),
            dials: AtomicUsize::new(0),
            udp_opens: AtomicUsize::new(0),
            next: Mutex::new(None),
        }
    }

    pub fn with_type(mut self, proxy_type: ProxyType) -> Self {
        self.proxy_type = proxy_type;
        self
    }

    pub fn with_addr(mut self, addr: &str) -> Self {
        self.addr = addr.to_string();
        self
    }

    pub fn with_caps(mut self, udp: bool, uot: bool, with_dialer: bool) -> Self {
        self.udp = udp;
        self.uot = uot;
        self.with_dialer = with_dialer;
        self
    }

    /// Behave like a group resolving to `next`
    pub fn unwrapping_to(self, next: AnyProxy) -> Self {
        *self.next.lock() = Some(next);
        self
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn udp_opens(&self) -> usize {
        self.udp_opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboundProxy for MockProxy {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxy_type(&self) -> ProxyType {
        self.proxy_type
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }

    fn support_udp(&self) -> bool {
        self.udp
    }

    fn support_uot(&self) -> bool {
        self.uot
    }

    fn support_with_dialer(&self) -> bool {
        self.with_dialer
    }

    async fn dial_tcp_with_dialer(
        &self,
        _dialer: Arc<dyn Dialer>,
        _metadata: &Metadata,
    ) -> Result<ChainedStream> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::connection(format!("{} refused", self.name)));
        }
        let (a, _b) = tokio::io::duplex(64);
        Ok(ChainedStream::new(Box::new(a)))
    }

    /// Passes packets straight to whatever `dialer` opens
    async fn listen_udp_with_dialer(
        &self,
        dialer: Arc<dyn Dialer>,
        metadata: &Metadata,
    ) -> Result<ChainedDatagram> {
        self.udp_opens.fetch_add(1, Ordering::SeqCst);
        if !self.udp {
            return Err(Error::unsupported(format!("{} does not support UDP", self.name)));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::connection(format!("{} refused", self.name)));
        }
        Ok(ChainedDatagram::new(dialer.listen_udp(metadata).await?))
    }

    fn unwrap(&self, _metadata: &Metadata, _touch: bool) -> Option<AnyProxy> {
        self.next.lock().clone()
    }
}

/// Wrap a fresh mock in a proxy handle
pub fn mock(name: &str) -> AnyProxy {
    Proxy::new(Arc::new(MockProxy::new(name)))
}

/// Like [`mock`] but also hands back the adapter for scripting
pub fn mock_with_handle(name: &str) -> (AnyProxy, Arc<MockProxy>) {
    let adapter = Arc::new(MockProxy::new(name));
    (Proxy::new(adapter.clone()), adapter)
}

/// A proxy handle with one recorded delay sample
pub fn measured(name: &str, delay: u16) -> AnyProxy {
    let proxy = mock(name);
    proxy.record_delay(Some(delay));
    proxy
}

/// A proxy handle that is marked dead
pub fn dead(name: &str) -> AnyProxy {
    let proxy = mock(name);
    proxy.set_alive(false);
    proxy
}

/// Provider whose list and version are set by the test
pub struct ScriptedProvider {
    name: String,
    proxies: RwLock<Vec<AnyProxy>>,
    version: AtomicU32,
    pub reads: AtomicUsize,
    pub checks: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: &str, proxies: Vec<AnyProxy>) -> Arc<Self> {
        Arc::new(ScriptedProvider {
            name: name.to_string(),
            proxies: RwLock::new(proxies),
            version: AtomicU32::new(1),
            reads: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
        })
    }

    pub fn replace(&self, proxies: Vec<AnyProxy>) {
        *self.proxies.write() = proxies;
        self.version.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProxyProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn vehicle_type(&self) -> VehicleType {
        VehicleType::HTTP
    }

    fn proxies(&self) -> Vec<AnyProxy> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.proxies.read().clone()
    }

    fn touch(&self) {}

    fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    async fn health_check(&self) {
        self.checks.fetch_add(1, Ordering::SeqCst);
    }

    async fn initial(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self) -> Result<()> {
        Ok(())
    }

    fn health_check_url(&self) -> String {
        String::new()
    }

    fn updated_at(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn subscription_info(&self) -> Option<SubscriptionInfo> {
        None
    }

    async fn close(&self) {}
}

/// Scripted provider erased to the trait object groups take
pub fn provider(name: &str, proxies: Vec<AnyProxy>) -> Arc<dyn ProxyProvider> {
    ScriptedProvider::new(name, proxies)
}

pub fn erase<P: ProxyProvider + 'static>(provider: Arc<P>) -> Arc<dyn ProxyProvider> {
    provider
}
