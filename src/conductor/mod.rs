//! Conductor - owner of every device instance
//!
//! The Conductor:
//! - Registers devices through the registry and keeps their handles
//! - Routes each resolved timeline state to every instance
//! - Holds the current mapping table (hot-reloadable)
//! - Merges the event streams of all instances into one receiver

mod dispatch;
mod registration;


use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::info;

use crate::config::AppConfig;
use crate::service::{DeviceClock, DeviceEvent, DeviceInstanceHandle};
use crate::timeline::Mappings;

pub struct Conductor {
    /// Running instances by device id
    pub(crate) devices: Arc<RwLock<BTreeMap<String, DeviceInstanceHandle>>>,
    /// Full mapping table; each instance filters its own entries
    pub(crate) mappings: Arc<RwLock<Arc<Mappings>>>,
    /// Clock shared by every instance
    pub(crate) clock: Arc<DeviceClock>,
    pub(crate) events_tx: mpsc::UnboundedSender<DeviceEvent>,
    /// Receiver for the merged event stream (taken once)
    pub(crate) events_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<DeviceEvent>>>>,
}

impl Conductor {
    pub fn new(mappings: Mappings) -> Self {
        Self::with_clock(mappings, Arc::new(DeviceClock::local()))
    }

    pub fn with_clock(mappings: Mappings, clock: Arc<DeviceClock>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            devices: Arc::new(RwLock::new(BTreeMap::new())),
            mappings: Arc::new(RwLock::new(Arc::new(mappings))),
            clock,
            events_tx,
            events_rx: Arc::new(Mutex::new(Some(events_rx))),
        }
    }

    /// Build a conductor and register every configured device
    pub async fn from_config(config: &AppConfig) -> anyhow::Result<Self> {
        let conductor = Self::new(config.mappings.clone());
        for (device_id, device) in &config.devices {
            conductor.add_device(device_id, device).await?;
        }
        Ok(conductor)
    }

    /// Take the merged device event receiver (should only be called once)
    pub async fn take_event_receiver(&self) -> Option<mpsc::UnboundedReceiver<DeviceEvent>> {
        self.events_rx.lock().await.take()
    }

    pub async fn mappings(&self) -> Arc<Mappings> {
        self.mappings.read().await.clone()
    }

    /// Replace the mapping table; applies from the next state on
    pub async fn set_mappings(&self, mappings: Mappings) {
        info!("🗺️  Mapping table updated ({} layers)", mappings.len());
        *self.mappings.write().await = Arc::new(mappings);
    }

    /// Device time shared by every instance
    pub fn current_time(&self) -> i64 {
        self.clock.now()
    }
}
