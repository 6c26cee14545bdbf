//! Device registry - static table of every device kind
//!
//! Maps a `DeviceType` to its connection capability, display name,
//! execution discipline and a constructor that wires the device into a
//! fresh instance actor.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::clock::DeviceClock;
use super::events::DeviceEvent;
use super::executor::ExecutionMode;
use super::instance::{DeviceInstance, DeviceInstanceHandle, InstanceConfig};
use crate::devices::abstract_device::AbstractDevice;
use crate::devices::gsaas::GsaasDevice;
use crate::devices::quantel::QuantelDevice;
use crate::devices::sisyfos::SisyfosDevice;
use crate::devices::Transport;
use crate::error::ConfigError;
use crate::timeline::DeviceType;

pub type SpawnFn = fn(
    InstanceConfig,
    Arc<dyn Transport>,
    Arc<DeviceClock>,
    mpsc::UnboundedSender<DeviceEvent>,
) -> DeviceInstanceHandle;

#[derive(Clone, Copy)]
pub struct DeviceEntry {
    pub can_connect: bool,
    pub device_name: fn(&str) -> String,
    pub execution_mode: ExecutionMode,
    pub spawn: SpawnFn,
}

static REGISTRY: Lazy<HashMap<DeviceType, DeviceEntry>> = Lazy::new(|| {
    let mut registry = HashMap::new();
    registry.insert(
        DeviceType::Abstract,
        DeviceEntry {
            can_connect: false,
            device_name: |id| format!("Abstract {}", id),
            execution_mode: ExecutionMode::Salvo,
            spawn: |config, transport, clock, events| {
                DeviceInstance::<AbstractDevice>::spawn(config, clock, events, |ctx| AbstractDevice::new(ctx, transport))
            },
        },
    );
    registry.insert(
        DeviceType::Sisyfos,
        DeviceEntry {
            can_connect: true,
            device_name: |id| format!("Sisyfos {}", id),
            execution_mode: ExecutionMode::Salvo,
            spawn: |config, transport, clock, events| {
                DeviceInstance::<SisyfosDevice>::spawn(config, clock, events, |ctx| SisyfosDevice::new(ctx, transport))
            },
        },
    );
    registry.insert(
        DeviceType::BbcGsaas,
        DeviceEntry {
            can_connect: false,
            device_name: |id| format!("BBC GSAAS {}", id),
            execution_mode: ExecutionMode::Sequential,
            spawn: |config, transport, clock, events| {
                DeviceInstance::<GsaasDevice>::spawn(config, clock, events, |ctx| GsaasDevice::new(ctx, transport))
            },
        },
    );
    registry.insert(
        DeviceType::Quantel,
        DeviceEntry {
            can_connect: true,
            device_name: |id| format!("Quantel {}", id),
            execution_mode: ExecutionMode::Sequential,
            spawn: |config, transport, clock, events| {
                DeviceInstance::<QuantelDevice>::spawn(config, clock, events, |ctx| QuantelDevice::new(ctx, transport))
            },
        },
    );
    registry
});

pub fn registry_entry(device_type: DeviceType) -> Result<&'static DeviceEntry, ConfigError> {
    REGISTRY
        .get(&device_type)
        .ok_or_else(|| ConfigError::UnregisteredDeviceType(device_type.to_string()))
}
