//! Messages for the device instance actor
//!
//! `InstanceCommand` comes from the outside through the handle and is not
//! generic over the device. `DeviceMessage` comes from the device itself
//! (through its `DeviceContext`) and from the instance's own batch tasks.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::DeviceDetails;
use crate::devices::{ActionExecutionResult, DeviceStatus};
use crate::service::executor::ExecutionReport;
use crate::state::AddressState;
use crate::timeline::{Mappings, TimelineState};

#[derive(Debug)]
pub enum InstanceCommand {
    // -------------------------------------------------------------------------
    // Fire and forget
    // -------------------------------------------------------------------------
    /// New resolved state; mappings are the full table, the instance filters
    HandleState {
        state: Arc<TimelineState>,
        mappings: Arc<Mappings>,
    },

    /// Drop queued states at or after `time`
    ClearFuture { time: i64 },

    // -------------------------------------------------------------------------
    // Request-response
    // -------------------------------------------------------------------------
    ExecuteAction {
        action_id: String,
        payload: Option<Value>,
        response: oneshot::Sender<ActionExecutionResult>,
    },

    GetStatus {
        response: oneshot::Sender<DeviceStatus>,
    },

    GetDetails {
        response: oneshot::Sender<DeviceDetails>,
    },

    /// Drop queued states, terminate the device and stop the actor
    Terminate {
        response: oneshot::Sender<anyhow::Result<()>>,
    },
}

#[derive(Debug)]
pub enum DeviceMessage<S, A> {
    /// Device state unknown; re-send the current target from scratch
    ResetState,
    /// Device holds this state; converge from it
    ResetToState(S),
    /// Re-diff the current target against the freshest device state
    RecalcDiff,
    /// Feedback for one address
    SetAddressState { address: String, state: AddressState<A> },
    GetCurrentState {
        response: oneshot::Sender<Option<S>>,
    },
    /// A dispatched batch finished
    BatchExecuted(ExecutionReport),
}
