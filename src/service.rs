//! Device service layer - instances, scheduling and the registry
//!
//! Each configured device runs inside a `DeviceInstance` actor which owns the
//! state history, the optional address tracker and the clock, and hands due
//! command batches to the `CommandExecutor`.

pub mod clock;
pub mod events;
pub mod executor;
pub mod instance;
pub mod registry;

pub use clock::{DeviceClock, TimeSource};
pub use events::{DeviceEvent, DeviceEventKind};
pub use executor::{CommandExecutor, ExecutionMode, ExecutionReport};
pub use instance::{DeviceDetails, DeviceInstance, DeviceInstanceHandle, InstanceConfig, InstanceOptions};
pub use registry::{registry_entry, DeviceEntry};
