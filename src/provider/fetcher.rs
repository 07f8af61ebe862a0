//! Content fetching with a local cache file and periodic refresh

use super::VehicleType;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Where provider content comes from
#[async_trait]
pub trait Vehicle: Send + Sync {
    fn vehicle_type(&self) -> VehicleType;

    /// Local cache (HTTP) or source (File) path
    fn path(&self) -> &Path;

    async fn read(&self) -> Result<Vec<u8>>;

    /// Raw `subscription-userinfo` header of the last successful read
    fn subscription_userinfo(&self) -> Option<String> {
        None
    }
}

pub struct FileVehicle {
    path: PathBuf,
}

impl FileVehicle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileVehicle { path: path.into() }
    }
}

#[async_trait]
impl Vehicle for FileVehicle {
    fn vehicle_type(&self) -> VehicleType {
        VehicleType::File
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&self.path).await?)
    }
}

pub struct HttpVehicle {
    url: String,
    path: PathBuf,
    client: reqwest::Client,
    userinfo: Mutex<Option<String>>,
}

impl HttpVehicle {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("mihomo-groups/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::network(e.to_string()))?;

        Ok(HttpVehicle {
            url: url.into(),
            path: path.into(),
            client,
            userinfo: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Vehicle for HttpVehicle {
    fn vehicle_type(&self) -> VehicleType {
        VehicleType::HTTP
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?;

        let userinfo = resp
            .headers()
            .get("subscription-userinfo")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        if userinfo.is_some() {
            *self.userinfo.lock() = userinfo;
        }

        Ok(resp.bytes().await?.to_vec())
    }

    fn subscription_userinfo(&self) -> Option<String> {
        self.userinfo.lock().clone()
    }
}

pub type Parser<T> = Box<dyn Fn(&[u8]) -> Result<T> + Send + Sync>;

/// Outcome of the initial load
pub struct Initial<T> {
    pub value: T,
    /// The cache file was older than the refresh interval
    pub stale: bool,
}

/// Loads and refreshes one provider's content.
///
/// Content is identified by its MD5; a refresh yielding identical bytes only
/// bumps `updated_at`.
pub struct Fetcher<T> {
    name: String,
    interval: Duration,
    vehicle: Arc<dyn Vehicle>,
    parser: Parser<T>,
    hash: Mutex<Option<[u8; 16]>>,
    updated_at: Mutex<Option<DateTime<Utc>>>,
}

impl<T: Send + 'static> Fetcher<T> {
    pub fn new(name: String, interval: Duration, vehicle: Arc<dyn Vehicle>, parser: Parser<T>) -> Self {
        Fetcher {
            name,
            interval,
            vehicle,
            parser,
            hash: Mutex::new(None),
            updated_at: Mutex::new(None),
        }
    }

    pub fn vehicle(&self) -> &Arc<dyn Vehicle> {
        &self.vehicle
    }

    pub fn vehicle_type(&self) -> VehicleType {
        self.vehicle.vehicle_type()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        *self.updated_at.lock()
    }

    /// Prefer the local file; fall back to the vehicle when it is missing or unparsable.
    pub async fn initial(&self) -> Result<Initial<T>> {
        let path = self.vehicle.path().to_path_buf();
        let mut stale = false;

        let (buf, mut local) = match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                let buf = tokio::fs::read(&path).await?;
                let modified = meta.modified().unwrap_or_else(|_| SystemTime::now());
                *self.updated_at.lock() = Some(DateTime::<Utc>::from(modified));
                if !self.interval.is_zero() {
                    let age = SystemTime::now()
                        .duration_since(modified)
                        .unwrap_or_default();
                    stale = age > self.interval;
                }
                (buf, true)
            }
            Err(_) => (self.vehicle.read().await?, false),
        };

        let (buf, value) = match (self.parser)(&buf) {
            Ok(value) => (buf, value),
            Err(e) if local && self.vehicle.vehicle_type() != VehicleType::File => {
                warn!("[Provider] {} cache file unusable, fetching: {}", self.name, e);
                let buf = self.vehicle.read().await?;
                let value = (self.parser)(&buf)?;
                local = false;
                (buf, value)
            }
            Err(e) => return Err(e),
        };

        if !local {
            if self.vehicle.vehicle_type() != VehicleType::File {
                safe_write(&path, &buf).await?;
            }
            *self.updated_at.lock() = Some(Utc::now());
        }
        *self.hash.lock() = Some(md5_digest(&buf));

        Ok(Initial { value, stale })
    }

    /// `Ok(None)` when the content did not change.
    pub async fn update(&self) -> Result<Option<T>> {
        let buf = self.vehicle.read().await?;
        let hash = md5_digest(&buf);

        if *self.hash.lock() == Some(hash) {
            *self.updated_at.lock() = Some(Utc::now());
            touch_mtime(self.vehicle.path());
            return Ok(None);
        }

        let value = (self.parser)(&buf)?;
        if self.vehicle.vehicle_type() != VehicleType::File {
            safe_write(self.vehicle.path(), &buf).await?;
        }
        *self.hash.lock() = Some(hash);
        *self.updated_at.lock() = Some(Utc::now());
        Ok(Some(value))
    }

    /// Refresh every `interval` until `token` fires; no-op for a zero interval.
    pub fn start_pull_loop<F>(self: &Arc<Self>, token: CancellationToken, immediately: bool, on_update: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if self.interval.is_zero() {
            return;
        }
        let fetcher = self.clone();
        tokio::spawn(async move {
            if immediately {
                fetcher.pull_once(&on_update).await;
            }
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(fetcher.interval) => fetcher.pull_once(&on_update).await,
                }
            }
            debug!("[Provider] {} pull loop stopped", fetcher.name);
        });
    }

    async fn pull_once<F: Fn(T)>(&self, on_update: &F) {
        match self.update().await {
            Err(e) => warn!("[Provider] {} pull error: {}", self.name, e),
            Ok(None) => debug!("[Provider] {}'s content doesn't change", self.name),
            Ok(Some(value)) => {
                info!("[Provider] {}'s content update", self.name);
                on_update(value);
            }
        }
    }
}

fn md5_digest(buf: &[u8]) -> [u8; 16] {
    let mut out = [0u8; 16];
    out.copy_from_slice(&Md5::digest(buf));
    out
}

fn touch_mtime(path: &Path) {
    let result = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .and_then(|f| f.set_modified(SystemTime::now()));
    if let Err(e) = result {
        debug!("touch {}: {}", path.display(), e);
    }
}

async fn safe_write(path: &Path, buf: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(dir).await?;
        }
    }
    tokio::fs::write(path, buf).await?;
    Ok(())
}
