//! Events emitted by device instances
//!
//! Fire-and-forget notifications for observers (logging, status displays,
//! the resolver). Nothing waits on their delivery.

use crate::devices::DeviceStatus;
use crate::error::CommandError;

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub device_id: String,
    pub kind: DeviceEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEventKind {
    ConnectionChanged(DeviceStatus),
    CommandError(CommandError),
    /// Command handed to the device later than the configured limit
    SlowSentCommand {
        context: String,
        timeline_obj_id: String,
        delay_ms: u64,
    },
    /// Command completed later than the configured limit
    SlowFulfilledCommand {
        context: String,
        timeline_obj_id: String,
        delay_ms: u64,
    },
    /// Per-command report when `reportAllCommands` is set
    CommandReport {
        context: String,
        timeline_obj_id: String,
        sent_delay_ms: u64,
        fulfilled_delay_ms: u64,
    },
    /// The device wants its states re-sent
    ResyncRequested,
    /// The device wants the timeline resolved again
    ResetResolver,
    Warning(String),
    Error(String),
}

impl DeviceEvent {
    pub fn new(device_id: impl Into<String>, kind: DeviceEventKind) -> Self {
        Self {
            device_id: device_id.into(),
            kind,
        }
    }
}
