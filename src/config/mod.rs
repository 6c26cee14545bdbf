//! Configuration management for Playout GW
//!
//! Handles loading, parsing, validation and hot-reloading of the YAML file
//! declaring devices and the layer mapping table.

pub mod watcher;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::fs;

pub use watcher::{ConfigUpdate, ConfigWatcher};

use crate::error::ConfigError;
use crate::service::{registry_entry, InstanceOptions};
use crate::timeline::{DeviceType, Mappings};

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
    #[serde(default)]
    pub mappings: Mappings,
}

/// One configured device: its kind with connection options, plus the
/// options every instance understands
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceConfig {
    #[serde(flatten)]
    pub options: DeviceOptions,
    #[serde(flatten)]
    pub instance: InstanceOptions,
}

impl DeviceConfig {
    pub fn device_type(&self) -> DeviceType {
        self.options.device_type()
    }
}

/// Device kind and its connection options
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", content = "options", rename_all = "camelCase")]
pub enum DeviceOptions {
    Abstract,
    #[serde(rename_all = "camelCase")]
    Sisyfos {
        host: String,
        #[serde(default = "default_sisyfos_port")]
        port: u16,
    },
    #[serde(rename_all = "camelCase")]
    BbcGsaas { broker_url: String },
    #[serde(rename_all = "camelCase")]
    Quantel {
        gateway_url: String,
        #[serde(default)]
        isa_urls: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zone_id: Option<String>,
        server_id: u32,
    },
}

impl DeviceOptions {
    pub fn device_type(&self) -> DeviceType {
        match self {
            DeviceOptions::Abstract => DeviceType::Abstract,
            DeviceOptions::Sisyfos { .. } => DeviceType::Sisyfos,
            DeviceOptions::BbcGsaas { .. } => DeviceType::BbcGsaas,
            DeviceOptions::Quantel { .. } => DeviceType::Quantel,
        }
    }

    /// Where the device lives, for logs and transport names
    pub fn endpoint(&self) -> Option<String> {
        match self {
            DeviceOptions::Abstract => None,
            DeviceOptions::Sisyfos { host, port } => Some(format!("{}:{}", host, port)),
            DeviceOptions::BbcGsaas { broker_url } => Some(broker_url.clone()),
            DeviceOptions::Quantel { gateway_url, .. } => Some(gateway_url.clone()),
        }
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::parse(&contents).with_context(|| format!("Invalid config file: {}", path))
    }

    /// Parse and validate YAML text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(contents).context("Failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        for (device_id, device) in &self.devices {
            if device_id.is_empty() {
                anyhow::bail!("Device id cannot be empty");
            }
            registry_entry(device.device_type())?;
            self.validate_device_options(device_id, &device.options)?;
        }

        for (layer, mapping) in &self.mappings {
            let Some(device) = self.devices.get(&mapping.device_id) else {
                return Err(ConfigError::UnknownDevice {
                    layer: layer.clone(),
                    device_id: mapping.device_id.clone(),
                }
                .into());
            };
            if device.device_type() != mapping.device_type() {
                return Err(ConfigError::DeviceTypeMismatch {
                    layer: layer.clone(),
                    device_id: mapping.device_id.clone(),
                    mapping: mapping.device_type().to_string(),
                    device: device.device_type().to_string(),
                }
                .into());
            }
        }

        Ok(())
    }

    fn validate_device_options(&self, device_id: &str, options: &DeviceOptions) -> Result<()> {
        match options {
            DeviceOptions::Abstract => {}
            DeviceOptions::Sisyfos { host, port } => {
                if host.is_empty() {
                    anyhow::bail!("Device '{}' host cannot be empty", device_id);
                }
                if *port == 0 {
                    anyhow::bail!("Device '{}' has invalid port 0", device_id);
                }
            }
            DeviceOptions::BbcGsaas { broker_url } => {
                if broker_url.is_empty() {
                    anyhow::bail!("Device '{}' brokerUrl cannot be empty", device_id);
                }
            }
            DeviceOptions::Quantel { gateway_url, .. } => {
                if gateway_url.is_empty() {
                    anyhow::bail!("Device '{}' gatewayUrl cannot be empty", device_id);
                }
            }
        }
        Ok(())
    }

    /// Devices of one kind, for listings
    pub fn devices_of_type(&self, device_type: DeviceType) -> impl Iterator<Item = (&String, &DeviceConfig)> {
        self.devices
            .iter()
            .filter(move |(_, d)| d.device_type() == device_type)
    }
}

/// What a reloaded config changes relative to the running one
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Same id, different type or options; the device is restarted
    pub changed: Vec<String>,
    pub mappings_changed: bool,
}

impl ConfigChanges {
    pub fn between(old: &AppConfig, new: &AppConfig) -> Self {
        let mut changes = ConfigChanges {
            mappings_changed: old.mappings != new.mappings,
            ..Default::default()
        };
        for (device_id, device) in &new.devices {
            match old.devices.get(device_id) {
                None => changes.added.push(device_id.clone()),
                Some(previous) if previous != device => changes.changed.push(device_id.clone()),
                Some(_) => {}
            }
        }
        changes.removed = old
            .devices
            .keys()
            .filter(|id| !new.devices.contains_key(*id))
            .cloned()
            .collect();
        changes
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty() && !self.mappings_changed
    }
}

impl std::fmt::Display for ConfigChanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "+{} -{} ~{} devices, mappings {}",
            self.added.len(),
            self.removed.len(),
            self.changed.len(),
            if self.mappings_changed { "changed" } else { "unchanged" }
        )
    }
}

fn default_sisyfos_port() -> u16 {
    1176
}
