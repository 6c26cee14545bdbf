//! Playout GW - device state reconciliation for broadcast playout
//!
//! Turns a resolved timeline state plus a layer mapping table into
//! per-device states, diffs them into ordered command batches and delivers
//! those batches with lead-time and queue ordering guarantees.

pub mod command;
pub mod conductor;
pub mod config;
pub mod devices;
pub mod error;
pub mod service;
pub mod state;
pub mod timeline;

pub use command::CommandWithContext;
pub use conductor::Conductor;
pub use config::AppConfig;
pub use devices::{ActionExecutionResult, ActionResultCode, Device, DeviceStatus, StatusCode};
pub use service::{DeviceEvent, DeviceEventKind, DeviceInstanceHandle, ExecutionMode};
pub use timeline::{DeviceType, Mapping, Mappings, TimelineState};
