//! DeviceInstance - one actor per configured device
//!
//! The actor serializes everything that touches the device's history and
//! tracker: incoming timeline states, feedback, resets and batch reports.
//! Command batches and actions run on spawned tasks so feedback keeps
//! flowing while hardware is busy.

mod actor;
mod commands;
mod handle;

#[cfg(test)]
mod tests;

pub use actor::DeviceInstance;
pub use commands::{DeviceMessage, InstanceCommand};
pub use handle::DeviceInstanceHandle;

use serde::{Deserialize, Serialize};

use super::executor::ExecutionMode;
use crate::timeline::DeviceType;

/// Per-device options shared by every device type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstanceOptions {
    /// Run without the address tracker even when the device supports it
    pub disable_shared_hardware_control: bool,
    /// Report commands handed to the device later than this (ms)
    pub limit_slow_sent_command: Option<u64>,
    /// Report commands completed later than this (ms)
    pub limit_slow_fulfilled_command: Option<u64>,
    /// Emit a `CommandReport` for every command
    pub report_all_commands: bool,
}

/// Everything an instance needs to know about its device besides the device
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub device_id: String,
    pub device_type: DeviceType,
    pub device_name: String,
    pub can_connect: bool,
    pub execution_mode: ExecutionMode,
    pub options: InstanceOptions,
}

/// Static description of a running instance
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDetails {
    pub device_id: String,
    pub device_type: DeviceType,
    pub device_name: String,
    pub can_connect: bool,
    pub connected: bool,
    pub execution_mode: ExecutionMode,
    pub actions: Vec<String>,
    /// Queued future states
    pub queued_states: usize,
}
