//! Routing of states, actions and queries to the device instances

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::devices::{ActionExecutionResult, DeviceStatus};
use crate::service::DeviceDetails;
use crate::timeline::TimelineState;

impl super::Conductor {
    /// Hand a resolved state to every instance
    ///
    /// State and mapping table are shared, not copied; each instance keeps
    /// the mappings that target it.
    pub async fn handle_state(&self, state: TimelineState) {
        let state = Arc::new(state);
        let mappings = self.mappings().await;
        let devices = self.devices.read().await;

        trace!(time = state.time, layers = state.layers.len(), "Routing state to {} devices", devices.len());
        for handle in devices.values() {
            handle.handle_state(state.clone(), mappings.clone());
        }
    }

    /// Drop queued states at or after `time` on every instance
    pub async fn clear_future(&self, time: i64) {
        debug!(time, "Clearing future states");
        for handle in self.devices.read().await.values() {
            handle.clear_future(time);
        }
    }

    pub async fn execute_action(
        &self,
        device_id: &str,
        action_id: &str,
        payload: Option<Value>,
    ) -> Result<ActionExecutionResult> {
        let handle = self
            .get_device(device_id)
            .await
            .ok_or_else(|| anyhow!("Device '{}' not registered", device_id))?;

        debug!("Executing {}.{}", device_id, action_id);
        Ok(handle.execute_action(action_id, payload).await)
    }

    /// Status of every running instance; stopped ones are left out
    pub async fn get_status_all(&self) -> BTreeMap<String, DeviceStatus> {
        let handles: Vec<_> = self
            .devices
            .read()
            .await
            .iter()
            .map(|(id, h)| (id.clone(), h.clone()))
            .collect();

        let mut statuses = BTreeMap::new();
        for (device_id, handle) in handles {
            if let Some(status) = handle.get_status().await {
                statuses.insert(device_id, status);
            }
        }
        statuses
    }

    pub async fn get_details_all(&self) -> Vec<DeviceDetails> {
        let handles: Vec<_> = self.devices.read().await.values().cloned().collect();

        let mut details = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(d) = handle.get_details().await {
                details.push(d);
            }
        }
        details
    }
}
