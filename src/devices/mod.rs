//! Device integrations and the state-diff contract they implement
//!
//! Every device kind goes through the same three stages:
//! 1. `convert_timeline_state` - resolved timeline state -> device state
//! 2. `diff_states` - (old, new) device state -> ordered commands
//! 3. `send_command` - one command onto the transport
//!
//! Devices whose hardware can also be driven by a third party expose a
//! `SharedControl` capability so the instance can track ownership per address.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use crate::command::CommandWithContext;
use crate::error::{CommandError, ConversionError, DiffError};
use crate::state::AddressState;
use crate::timeline::{Mappings, TimelineState};

pub mod abstract_device;
pub mod context;
pub mod gsaas;
pub mod quantel;
pub mod sisyfos;
pub mod transport;

pub use context::DeviceContext;
#[cfg(test)]
pub use transport::RecordingTransport;
pub use transport::{FeedbackCallback, LoggingTransport, Transport};

/// Severity of a device status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusCode {
    Unknown = 0,
    Good = 1,
    WarningMinor = 2,
    WarningMajor = 3,
    Bad = 4,
    Fatal = 5,
}

/// Device health as reported by the device, plus whether anything maps to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub status_code: StatusCode,
    pub messages: Vec<String>,
    /// Some mapping targets this device
    pub active: bool,
}

impl DeviceStatus {
    pub fn good() -> Self {
        Self {
            status_code: StatusCode::Good,
            messages: Vec::new(),
            active: false,
        }
    }

    pub fn bad(message: impl Into<String>) -> Self {
        Self {
            status_code: StatusCode::Bad,
            messages: vec![message.into()],
            active: false,
        }
    }

    /// Raise the severity (never lowers it) and record the reason
    pub fn escalate(&mut self, code: StatusCode, message: impl Into<String>) {
        if code > self.status_code {
            self.status_code = code;
        }
        self.messages.push(message.into());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionResultCode {
    Ok,
    Error,
}

/// Outcome of a side-channel device action
///
/// Failures are ordinary values here; an action never panics or errors out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionExecutionResult {
    pub result: ActionResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

impl ActionExecutionResult {
    pub fn ok() -> Self {
        Self {
            result: ActionResultCode::Ok,
            response: None,
        }
    }

    pub fn error(response: impl Into<String>) -> Self {
        Self {
            result: ActionResultCode::Error,
            response: Some(response.into()),
        }
    }

    pub fn not_found(action_id: &str) -> Self {
        Self::error(format!("Action \"{}\" not found", action_id))
    }

    pub fn is_ok(&self) -> bool {
        self.result == ActionResultCode::Ok
    }
}

/// Result of converting a timeline state for one device
#[derive(Debug, Clone, PartialEq)]
pub struct Converted<S, A> {
    pub device_state: S,
    /// Per-address states, empty for devices without shared control
    pub address_states: BTreeMap<String, AddressState<A>>,
}

impl<S, A> Converted<S, A> {
    pub fn state_only(device_state: S) -> Self {
        Self {
            device_state,
            address_states: BTreeMap::new(),
        }
    }
}

/// Shared hardware control capability
///
/// Implemented by devices whose addresses can be changed behind our back.
pub trait SharedControl<S, A>: Send + Sync {
    /// Overlay an address state onto a full device state
    fn apply_address_state(&self, state: &mut S, address: &str, address_state: &AddressState<A>);

    /// Content comparison, ignoring ownership. `true` when they differ.
    fn diff_address_states(&self, a: &AddressState<A>, b: &AddressState<A>) -> bool;

    /// Whether `new` takes control away from `old`
    fn address_state_reasserts_control(
        &self,
        old: Option<&AddressState<A>>,
        new: &AddressState<A>,
    ) -> bool {
        old.map(|o| o.control_value.as_str()) != Some(new.control_value.as_str())
    }
}

/// State-diff contract every device kind implements
///
/// Methods take `&self` so the device can be shared between the instance
/// actor and the tasks executing its command batches. Mutable device state
/// lives behind interior mutability.
#[async_trait]
pub trait Device: Send + Sync + 'static {
    type State: Clone + PartialEq + Debug + Send + Sync + 'static;
    type Command: Clone + Debug + Send + Sync + 'static;
    type AddressState: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Connect / prepare the device
    async fn init(&self) -> anyhow::Result<()>;

    async fn terminate(&self) -> anyhow::Result<()>;

    fn connected(&self) -> bool;

    /// Device health; `active` is filled in by the instance
    fn status(&self) -> DeviceStatus;

    /// Pure conversion. Identical inputs must give identical output.
    fn convert_timeline_state(
        &self,
        state: &TimelineState,
        mappings: &Mappings,
    ) -> Result<Converted<Self::State, Self::AddressState>, ConversionError>;

    /// Commands that move the device from `old` to `new`, in dependency order
    ///
    /// `old == None` means nothing is known about the device; each device
    /// documents what it emits in that case.
    fn diff_states(
        &self,
        old: Option<&Self::State>,
        new: &Self::State,
        mappings: &Mappings,
        time: i64,
    ) -> Result<Vec<CommandWithContext<Self::Command>>, DiffError>;

    async fn send_command(
        &self,
        command: &CommandWithContext<Self::Command>,
    ) -> Result<(), CommandError>;

    /// Ids accepted by `execute_action`
    fn action_ids(&self) -> Vec<&'static str> {
        Vec::new()
    }

    async fn execute_action(&self, action_id: &str, _payload: Option<Value>) -> ActionExecutionResult {
        ActionExecutionResult::not_found(action_id)
    }

    /// Capability object for shared hardware control, if supported
    fn shared_control(&self) -> Option<Arc<dyn SharedControl<Self::State, Self::AddressState>>> {
        None
    }
}

/// Fetch a string field of an action payload
pub(crate) fn payload_str<'a>(payload: Option<&'a Value>, key: &str) -> Option<&'a str> {
    payload.and_then(|p| p.get(key)).and_then(Value::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_escalation() {
        let mut status = DeviceStatus::good();
        status.escalate(StatusCode::WarningMinor, "slow");
        status.escalate(StatusCode::Bad, "Not connected");
        status.escalate(StatusCode::WarningMajor, "late");
        assert_eq!(status.status_code, StatusCode::Bad);
        assert_eq!(status.messages.len(), 3);
    }

    #[test]
    fn test_status_code_values() {
        assert_eq!(StatusCode::Unknown as u8, 0);
        assert_eq!(StatusCode::Fatal as u8, 5);
    }

    #[test]
    fn test_action_not_found_message() {
        let result = ActionExecutionResult::not_found("fly");
        assert_eq!(result.result, ActionResultCode::Error);
        assert_eq!(result.response.as_deref(), Some("Action \"fly\" not found"));
    }
}
