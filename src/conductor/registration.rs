//! Device registration and lifecycle management

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ConfigChanges, DeviceConfig};
use crate::devices::{LoggingTransport, Transport};
use crate::service::{registry_entry, DeviceInstanceHandle, InstanceConfig};

impl super::Conductor {
    /// Register a device with a logging transport
    ///
    /// The instance starts immediately; its device initialises inside the
    /// actor.
    pub async fn add_device(&self, device_id: &str, config: &DeviceConfig) -> Result<DeviceInstanceHandle> {
        let transport_name = match config.options.endpoint() {
            Some(endpoint) => format!("{} ({})", device_id, endpoint),
            None => device_id.to_string(),
        };
        self.add_device_with_transport(device_id, config, Arc::new(LoggingTransport::new(transport_name)))
            .await
    }

    /// Register a device talking through the given transport
    pub async fn add_device_with_transport(
        &self,
        device_id: &str,
        config: &DeviceConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<DeviceInstanceHandle> {
        debug!("Registering device '{}'...", device_id);

        let mut devices = self.devices.write().await;
        if devices.contains_key(device_id) {
            return Err(anyhow!("Device '{}' is already registered", device_id));
        }

        let device_type = config.device_type();
        let entry = registry_entry(device_type)
            .with_context(|| format!("Cannot register device '{}'", device_id))?;

        let instance_config = InstanceConfig {
            device_id: device_id.to_string(),
            device_type,
            device_name: (entry.device_name)(device_id),
            can_connect: entry.can_connect,
            execution_mode: entry.execution_mode,
            options: config.instance.clone(),
        };
        let handle = (entry.spawn)(instance_config, transport, self.clock.clone(), self.events_tx.clone());

        devices.insert(device_id.to_string(), handle.clone());
        info!("✅ Device '{}' registered ({})", device_id, device_type);
        Ok(handle)
    }

    pub async fn get_device(&self, device_id: &str) -> Option<DeviceInstanceHandle> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Registered device ids, sorted
    pub async fn list_devices(&self) -> Vec<String> {
        self.devices.read().await.keys().cloned().collect()
    }

    /// Terminate and forget one device
    pub async fn remove_device(&self, device_id: &str) -> Result<()> {
        let handle = self
            .devices
            .write()
            .await
            .remove(device_id)
            .ok_or_else(|| anyhow!("Device '{}' not registered", device_id))?;

        handle
            .terminate()
            .await
            .with_context(|| format!("Failed to terminate device '{}'", device_id))?;
        info!("Device '{}' removed", device_id);
        Ok(())
    }

    /// Apply a reloaded config
    ///
    /// Removed and changed devices are terminated, then added and changed
    /// ones started from their new config. Untouched devices keep running
    /// with their queues. Every device is attempted; the first failure is
    /// returned after the mapping table was swapped.
    pub async fn apply_config(&self, config: &AppConfig, changes: &ConfigChanges) -> Result<()> {
        let mut first_error = None;

        for device_id in changes.removed.iter().chain(&changes.changed) {
            if let Err(e) = self.remove_device(device_id).await {
                warn!("Failed to stop device '{}': {:#}", device_id, e);
            }
        }
        for device_id in changes.added.iter().chain(&changes.changed) {
            let Some(device) = config.devices.get(device_id) else {
                warn!("Device '{}' missing from reloaded config", device_id);
                continue;
            };
            if let Err(e) = self.add_device(device_id, device).await {
                warn!("Failed to start device '{}': {:#}", device_id, e);
                first_error.get_or_insert(e);
            }
        }

        if changes.mappings_changed {
            self.set_mappings(config.mappings.clone()).await;
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Terminate every registered device
    pub async fn shutdown_all(&self) -> Result<()> {
        debug!("Shutting down all devices...");

        let handles: Vec<_> = std::mem::take(&mut *self.devices.write().await)
            .into_iter()
            .collect();

        let mut errors = Vec::new();
        for (device_id, handle) in handles {
            debug!("Shutting down device '{}'...", device_id);
            if let Err(e) = handle.terminate().await {
                warn!("Failed to terminate device '{}': {}", device_id, e);
                errors.push((device_id, e));
            } else {
                debug!("Device '{}' shut down", device_id);
            }
        }

        if !errors.is_empty() {
            let error_msg = errors
                .iter()
                .map(|(n, e)| format!("{}: {}", n, e))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(anyhow!(
                "Failed to shutdown {} device(s): {}",
                errors.len(),
                error_msg
            ));
        }

        debug!("All devices shut down successfully");
        Ok(())
    }
}
