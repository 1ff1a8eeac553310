//! Device inventory snapshots.
//!
//! The inventory backend is pluggable: anything implementing
//! [`DeviceSource`] can feed the database. Snapshots are replaced wholesale
//! on every refresh; readers always see a consistent map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{error, info, warn};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::{Device, DeviceInfo};
use crate::error::{DeviceError, Result, TransportError};

/// Pluggable inventory fetcher.
///
/// `fetch` runs off the event loop when it blocks; implementations doing
/// synchronous I/O should wrap it in `tokio::task::spawn_blocking`.
#[async_trait]
pub trait DeviceSource: Send + Sync {
    async fn fetch(&self, name_filter: Option<&str>) -> Result<Vec<DeviceInfo>>;
}

/// A fixed in-memory inventory, for harnesses and tests.
pub struct StaticDeviceSource {
    devices: Vec<DeviceInfo>,
}

impl StaticDeviceSource {
    pub fn new(devices: Vec<DeviceInfo>) -> Self {
        Self { devices }
    }
}

#[async_trait]
impl DeviceSource for StaticDeviceSource {
    async fn fetch(&self, name_filter: Option<&str>) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .devices
            .iter()
            .filter(|d| name_filter.map_or(true, |f| d.hostname.contains(f)))
            .cloned()
            .collect())
    }
}

/// Inventory loaded from a JSON file holding a list of device records.
/// The file read happens on the blocking pool.
pub struct JsonFileSource {
    path: String,
}

impl JsonFileSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DeviceSource for JsonFileSource {
    async fn fetch(&self, name_filter: Option<&str>) -> Result<Vec<DeviceInfo>> {
        let path = self.path.clone();
        let data = tokio::task::spawn_blocking(move || std::fs::read_to_string(path))
            .await
            .map_err(|e| {
                TransportError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?
            .map_err(TransportError::Io)?;

        let devices: Vec<DeviceInfo> =
            serde_json::from_str(&data).map_err(DeviceError::ParseFailed)?;
        Ok(devices
            .into_iter()
            .filter(|d| name_filter.map_or(true, |f| d.hostname.contains(f)))
            .collect())
    }
}

type Snapshot = Arc<HashMap<String, Arc<DeviceInfo>>>;

/// Snapshot store over a [`DeviceSource`], refreshed on an interval.
pub struct DeviceDb {
    source: Arc<dyn DeviceSource>,
    snapshot: RwLock<Snapshot>,
    name_filter: Option<String>,
}

impl DeviceDb {
    pub fn new(source: Arc<dyn DeviceSource>, name_filter: Option<String>) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            name_filter,
        }
    }

    /// Fetch from the source and atomically replace the snapshot.
    pub async fn refresh(&self) -> Result<()> {
        let devices = self.source.fetch(self.name_filter.as_deref()).await?;

        let mut map: HashMap<String, Arc<DeviceInfo>> = HashMap::with_capacity(devices.len());
        for info in devices {
            let info = Arc::new(info);
            if let Some(alias) = &info.alias {
                map.insert(alias.clone(), info.clone());
            }
            map.insert(info.hostname.clone(), info);
        }

        info!("device db refreshed: {} entries", map.len());
        *self.snapshot.write().await = Arc::new(map);
        Ok(())
    }

    /// Look up the inventory record for a request.
    ///
    /// Unknown hostnames trigger one targeted fetch before failing, so
    /// devices added since the last refresh are still reachable.
    pub async fn get(&self, device: &Device) -> Result<Arc<DeviceInfo>> {
        if let Some(info) = self.snapshot.read().await.get(&device.hostname) {
            return Ok(info.clone());
        }

        match self.source.fetch(Some(&device.hostname)).await {
            Ok(fetched) => {
                if let Some(info) = fetched
                    .into_iter()
                    .find(|d| d.hostname == device.hostname || d.alias.as_deref() == Some(&device.hostname))
                {
                    let info = Arc::new(info);
                    let mut next: HashMap<String, Arc<DeviceInfo>> =
                        self.snapshot.read().await.as_ref().clone();
                    next.insert(info.hostname.clone(), info.clone());
                    *self.snapshot.write().await = Arc::new(next);
                    return Ok(info);
                }
            }
            Err(e) => warn!("on-demand fetch for {} failed: {e}", device.hostname),
        }

        Err(DeviceError::UnknownDevice {
            hostname: device.hostname.clone(),
        }
        .into())
    }

    pub async fn len(&self) -> usize {
        self.snapshot.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot.read().await.is_empty()
    }

    /// Periodic refresh task; runs until the handle is aborted.
    pub fn spawn_refresher(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let db = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = db.refresh().await {
                    error!("device db refresh failed: {e}");
                }
            }
        })
    }
}
