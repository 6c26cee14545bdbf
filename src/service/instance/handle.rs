//! DeviceInstanceHandle - public API of a device instance
//!
//! Not generic over the device: the conductor keeps handles of every device
//! kind in one map. Fire-and-forget methods for the state hot path, oneshot
//! round trips for queries.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::commands::InstanceCommand;
use super::DeviceDetails;
use crate::devices::{ActionExecutionResult, DeviceStatus};
use crate::service::clock::DeviceClock;
use crate::timeline::{Mappings, TimelineState};

/// Handle for interacting with one device instance
///
/// # Fire-and-forget
/// - `handle_state` - queue a resolved state
/// - `clear_future` - drop queued states
///
/// # Queries
/// - `execute_action`, `get_status`, `get_details`, `terminate`
#[derive(Clone)]
pub struct DeviceInstanceHandle {
    device_id: String,
    cmd_tx: mpsc::UnboundedSender<InstanceCommand>,
    clock: Arc<DeviceClock>,
}

impl DeviceInstanceHandle {
    pub fn new(
        device_id: String,
        cmd_tx: mpsc::UnboundedSender<InstanceCommand>,
        clock: Arc<DeviceClock>,
    ) -> Self {
        Self {
            device_id,
            cmd_tx,
            clock,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Whether the actor is still running
    pub fn is_alive(&self) -> bool {
        !self.cmd_tx.is_closed()
    }

    /// Device time in milliseconds since the epoch
    pub fn get_current_time(&self) -> i64 {
        self.clock.now()
    }

    // =========================================================================
    // Fire-and-forget
    // =========================================================================

    /// Queue a resolved timeline state
    ///
    /// `mappings` is the full table; the instance keeps its own entries.
    pub fn handle_state(&self, state: Arc<TimelineState>, mappings: Arc<Mappings>) {
        let _ = self
            .cmd_tx
            .send(InstanceCommand::HandleState { state, mappings });
    }

    /// Drop every queued state at or after `time`
    pub fn clear_future(&self, time: i64) {
        let _ = self.cmd_tx.send(InstanceCommand::ClearFuture { time });
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn execute_action(&self, action_id: &str, payload: Option<Value>) -> ActionExecutionResult {
        let (response, response_rx) = oneshot::channel();
        let cmd = InstanceCommand::ExecuteAction {
            action_id: action_id.to_string(),
            payload,
            response,
        };
        if self.cmd_tx.send(cmd).is_err() {
            return ActionExecutionResult::error("Device instance stopped");
        }
        response_rx
            .await
            .unwrap_or_else(|_| ActionExecutionResult::error("Device instance stopped"))
    }

    /// `None` once the instance stopped
    pub async fn get_status(&self) -> Option<DeviceStatus> {
        let (response, response_rx) = oneshot::channel();
        self.cmd_tx.send(InstanceCommand::GetStatus { response }).ok()?;
        response_rx.await.ok()
    }

    pub async fn get_details(&self) -> Option<DeviceDetails> {
        let (response, response_rx) = oneshot::channel();
        self.cmd_tx.send(InstanceCommand::GetDetails { response }).ok()?;
        response_rx.await.ok()
    }

    /// Stop the instance and wait for the device to terminate
    ///
    /// Terminating an instance that already stopped is not an error.
    pub async fn terminate(&self) -> anyhow::Result<()> {
        let (response, response_rx) = oneshot::channel();
        if self.cmd_tx.send(InstanceCommand::Terminate { response }).is_err() {
            return Ok(());
        }
        response_rx.await.unwrap_or(Ok(()))
    }
}
