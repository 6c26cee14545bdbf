//! DeviceContext - the device's line back to its instance
//!
//! Devices never mutate instance state directly. They notify through typed
//! methods which either queue a message for the instance actor (state
//! resets, feedback) or emit an observer event (connection, errors).

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::devices::DeviceStatus;
use crate::error::CommandError;
use crate::service::clock::DeviceClock;
use crate::service::events::{DeviceEvent, DeviceEventKind};
use crate::service::instance::DeviceMessage;
use crate::state::AddressState;

pub struct DeviceContext<S, A> {
    device_id: String,
    tx: mpsc::UnboundedSender<DeviceMessage<S, A>>,
    events: mpsc::UnboundedSender<DeviceEvent>,
    clock: Arc<DeviceClock>,
}

// Manual impl: S and A need not be Clone
impl<S, A> Clone for DeviceContext<S, A> {
    fn clone(&self) -> Self {
        Self {
            device_id: self.device_id.clone(),
            tx: self.tx.clone(),
            events: self.events.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<S, A> DeviceContext<S, A> {
    pub fn new(
        device_id: impl Into<String>,
        tx: mpsc::UnboundedSender<DeviceMessage<S, A>>,
        events: mpsc::UnboundedSender<DeviceEvent>,
        clock: Arc<DeviceClock>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            tx,
            events,
            clock,
        }
    }

    /// Context plus both receiving ends, for wiring an instance or a test
    pub fn channel(
        device_id: impl Into<String>,
        clock: Arc<DeviceClock>,
    ) -> (
        Self,
        mpsc::UnboundedReceiver<DeviceMessage<S, A>>,
        mpsc::UnboundedReceiver<DeviceEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (Self::new(device_id, tx, events_tx, clock), rx, events_rx)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn current_time(&self) -> i64 {
        self.clock.now()
    }

    fn emit(&self, kind: DeviceEventKind) {
        let _ = self.events.send(DeviceEvent::new(self.device_id.clone(), kind));
    }

    fn post(&self, message: DeviceMessage<S, A>) {
        if self.tx.send(message).is_err() {
            warn!(device_id = %self.device_id, "Device instance gone, dropping notification");
        }
    }

    pub fn connection_changed(&self, status: DeviceStatus) {
        self.emit(DeviceEventKind::ConnectionChanged(status));
    }

    pub fn command_error(&self, err: CommandError) {
        self.emit(DeviceEventKind::CommandError(err));
    }

    /// Ask the resolver to resolve the timeline again
    pub fn reset_resolver(&self) {
        self.emit(DeviceEventKind::ResetResolver);
    }

    /// Ask the owner to re-send the states
    pub fn resync_states(&self) {
        self.emit(DeviceEventKind::ResyncRequested);
    }

    /// Forget what the device holds and re-send the current target
    pub fn reset_state(&self) {
        self.post(DeviceMessage::ResetState);
    }

    /// The device holds `state`; converge from there to the current target
    pub fn reset_to_state(&self, state: S) {
        self.post(DeviceMessage::ResetToState(state));
    }

    /// Re-diff the current target against the freshest device state
    pub fn recalc_diff(&self) {
        self.post(DeviceMessage::RecalcDiff);
    }

    /// Feedback for one address
    pub fn set_address_state(&self, address: impl Into<String>, state: AddressState<A>) {
        self.post(DeviceMessage::SetAddressState {
            address: address.into(),
            state,
        });
    }

    /// Last target state handed to the executor
    pub async fn current_state(&self) -> Option<S> {
        let (response, rx) = oneshot::channel();
        self.post(DeviceMessage::GetCurrentState { response });
        rx.await.ok().flatten()
    }

    pub fn warning(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(device_id = %self.device_id, "{}", message);
        self.emit(DeviceEventKind::Warning(message));
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(device_id = %self.device_id, "{}", message);
        self.emit(DeviceEventKind::Error(message));
    }
}
