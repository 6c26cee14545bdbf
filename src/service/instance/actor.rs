//! Device instance actor loop

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::commands::{DeviceMessage, InstanceCommand};
use super::handle::DeviceInstanceHandle;
use super::{DeviceDetails, InstanceConfig};
use crate::command::CommandWithContext;
use crate::devices::{Device, DeviceContext};
use crate::error::DiffError;
use crate::service::clock::{DeviceClock, CLOCK_RESYNC_INTERVAL};
use crate::service::events::{DeviceEvent, DeviceEventKind};
use crate::service::executor::{CommandExecutor, ExecutionReport};
use crate::state::{mask_blocked_addresses, StateHistory, StateSnapshot, StateTracker, TrackerSignal};
use crate::timeline::{mappings_for_device, Mappings, TimelineState};

type Commands<D> = Vec<CommandWithContext<<D as Device>::Command>>;
type Snapshot<D> = StateSnapshot<<D as Device>::State, <D as Device>::AddressState>;
type Tracker<D> = StateTracker<<D as Device>::State, <D as Device>::AddressState>;

/// Diff through the tracker
///
/// The old state gets every blocked address replaced by what the device
/// reports. The new state only does so where it keeps the control value we
/// already assert; a new control value takes the address back.
fn masked_diff<'a, D: Device>(
    device: &'a D,
    tracker: Option<&'a Tracker<D>>,
) -> impl FnMut(Option<&D::State>, &Snapshot<D>) -> Result<Commands<D>, DiffError> + 'a {
    move |old, new| {
        let Some(tracker) = tracker else {
            return device.diff_states(old, &new.device_state, &new.mappings, new.time);
        };
        let old = old.map(|o| mask_blocked_addresses(o, tracker, |_| true));
        let target = mask_blocked_addresses(&new.device_state, tracker, |address| {
            let control_value = new.address_states.get(address).map(|a| a.control_value.as_str());
            tracker.yields_to(address, control_value)
        });
        device.diff_states(old.as_ref(), &target, &new.mappings, new.time)
    }
}

pub struct DeviceInstance<D: Device> {
    config: InstanceConfig,
    device: Arc<D>,
    executor: CommandExecutor,
    clock: Arc<DeviceClock>,
    history: StateHistory<D::State, D::AddressState, D::Command>,
    tracker: Option<Tracker<D>>,
    /// Some mapping of the latest state targets this device
    active: bool,
    events: mpsc::UnboundedSender<DeviceEvent>,
    command_rx: mpsc::UnboundedReceiver<InstanceCommand>,
    device_rx: mpsc::UnboundedReceiver<DeviceMessage<D::State, D::AddressState>>,
    /// Batch tasks report back on this
    device_tx: mpsc::UnboundedSender<DeviceMessage<D::State, D::AddressState>>,
}

impl<D: Device> DeviceInstance<D> {
    /// Build the device, spawn its actor and return a handle
    ///
    /// `build` receives the context the device uses to talk back to its
    /// instance. The device is initialised inside the actor task.
    pub fn spawn<F>(
        config: InstanceConfig,
        clock: Arc<DeviceClock>,
        events: mpsc::UnboundedSender<DeviceEvent>,
        build: F,
    ) -> DeviceInstanceHandle
    where
        F: FnOnce(DeviceContext<D::State, D::AddressState>) -> D,
    {
        let (cmd_tx, command_rx) = mpsc::unbounded_channel();
        let (device_tx, device_rx) = mpsc::unbounded_channel();

        let ctx = DeviceContext::new(config.device_id.clone(), device_tx.clone(), events.clone(), clock.clone());
        let device = Arc::new(build(ctx));

        let tracker = match device.shared_control() {
            Some(_) if config.options.disable_shared_hardware_control => {
                debug!(device_id = %config.device_id, "Shared hardware control disabled");
                None
            }
            Some(control) => Some(StateTracker::new(control)),
            None => None,
        };

        let handle = DeviceInstanceHandle::new(config.device_id.clone(), cmd_tx, clock.clone());
        let actor = DeviceInstance {
            executor: CommandExecutor::new(config.execution_mode),
            config,
            device,
            clock,
            history: StateHistory::new(),
            tracker,
            active: false,
            events,
            command_rx,
            device_rx,
            device_tx,
        };

        tokio::spawn(actor.run());
        handle
    }

    fn emit(&self, kind: DeviceEventKind) {
        let _ = self
            .events
            .send(DeviceEvent::new(self.config.device_id.clone(), kind));
    }

    async fn run(mut self) {
        let device_id = self.config.device_id.clone();
        info!(device_id = %device_id, "Device instance started ({})", self.config.device_name);

        if let Err(e) = self.device.init().await {
            error!(device_id = %device_id, "Device init failed: {:#}", e);
            self.emit(DeviceEventKind::Error(format!("Init failed: {:#}", e)));
        }

        let mut resync = interval(CLOCK_RESYNC_INTERVAL);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let next_due = self.history.next_due_time().map(|t| self.clock.instant_at(t));

            tokio::select! {
                cmd = self.command_rx.recv() => {
                    let Some(cmd) = cmd else {
                        debug!(device_id = %device_id, "All handles dropped");
                        break;
                    };
                    trace!(device_id = %device_id, ?cmd, "Instance command");
                    if self.handle_command(cmd).await {
                        break;
                    }
                }
                Some(message) = self.device_rx.recv() => {
                    self.handle_device_message(message);
                }
                _ = wait_until(next_due) => {
                    self.execute_due();
                }
                _ = resync.tick() => {
                    if self.clock.has_remote() {
                        let clock = self.clock.clone();
                        tokio::spawn(async move { clock.sync().await });
                    }
                }
            }
        }

        info!(device_id = %device_id, "Device instance stopped");
    }

    /// Returns `true` when the actor should stop
    async fn handle_command(&mut self, cmd: InstanceCommand) -> bool {
        match cmd {
            InstanceCommand::HandleState { state, mappings } => {
                self.handle_state(&state, &mappings);
            }
            InstanceCommand::ClearFuture { time } => {
                let dropped = self.history.clear_future_after_timestamp(time);
                debug!(device_id = %self.config.device_id, time, dropped, "Cleared future states");
            }
            InstanceCommand::ExecuteAction {
                action_id,
                payload,
                response,
            } => {
                // Actions may query the instance, so they run beside it
                let device = self.device.clone();
                tokio::spawn(async move {
                    let result = device.execute_action(&action_id, payload).await;
                    let _ = response.send(result);
                });
            }
            InstanceCommand::GetStatus { response } => {
                let mut status = self.device.status();
                status.active = self.active;
                let _ = response.send(status);
            }
            InstanceCommand::GetDetails { response } => {
                let _ = response.send(self.details());
            }
            InstanceCommand::Terminate { response } => {
                self.history.clear_future_after_timestamp(i64::MIN);
                let result = self.device.terminate().await;
                let _ = response.send(result);
                return true;
            }
        }
        false
    }

    fn details(&self) -> DeviceDetails {
        DeviceDetails {
            device_id: self.config.device_id.clone(),
            device_type: self.config.device_type,
            device_name: self.config.device_name.clone(),
            can_connect: self.config.can_connect,
            connected: self.device.connected(),
            execution_mode: self.config.execution_mode,
            actions: self.device.action_ids().into_iter().map(String::from).collect(),
            queued_states: self.history.pending_times().len(),
        }
    }

    fn handle_state(&mut self, state: &TimelineState, mappings: &Mappings) {
        let mappings = mappings_for_device(mappings, &self.config.device_id);
        self.active = !mappings.is_empty();

        let converted = match self.device.convert_timeline_state(state, &mappings) {
            Ok(converted) => converted,
            Err(e) => {
                warn!(device_id = %self.config.device_id, time = state.time, "Failed to convert timeline state: {}", e);
                self.emit(DeviceEventKind::Warning(format!("Failed to convert state at {}: {}", state.time, e)));
                return;
            }
        };

        let snapshot = StateSnapshot {
            time: state.time,
            device_state: converted.device_state,
            address_states: converted.address_states,
            mappings,
        };
        let result = {
            let mut diff = masked_diff(self.device.as_ref(), self.tracker.as_ref());
            self.history.insert(snapshot, &mut diff)
        };
        match result {
            Ok(count) => debug!(device_id = %self.config.device_id, time = state.time, count, "Queued state"),
            Err(e) => {
                warn!(device_id = %self.config.device_id, time = state.time, "Failed to diff state: {}", e);
                self.emit(DeviceEventKind::Warning(format!("Failed to diff state at {}: {}", state.time, e)));
            }
        }
    }

    /// Dispatch every change whose batch has to start now
    fn execute_due(&mut self) {
        let now = self.clock.now();
        while let Some(change) = self.history.pop_due(now) {
            trace!(
                device_id = %self.config.device_id,
                time = change.snapshot.time,
                late_ms = now - change.due_time(),
                "Executing state"
            );

            if let Some(tracker) = self.tracker.as_mut() {
                for (address, state) in &change.snapshot.address_states {
                    // Still yielding to whoever took it over
                    if tracker.is_blocked(address) && tracker.yields_to(address, Some(state.control_value.as_str())) {
                        continue;
                    }
                    tracker.update_expected_state(address, state.clone(), None);
                }
            }

            self.dispatch(change.commands);
        }
    }

    fn dispatch(&self, commands: Commands<D>) {
        if commands.is_empty() {
            return;
        }
        let device = self.device.clone();
        let executor = self.executor;
        let reply = self.device_tx.clone();

        tokio::spawn(async move {
            let report = executor
                .execute_commands(commands, |command| {
                    let device = device.clone();
                    async move { device.send_command(&command).await }
                })
                .await;
            let _ = reply.send(DeviceMessage::BatchExecuted(report));
        });
    }

    fn handle_device_message(&mut self, message: DeviceMessage<D::State, D::AddressState>) {
        match message {
            DeviceMessage::ResetState => {
                info!(device_id = %self.config.device_id, "Resetting device state");
                self.converge_from(None);
                self.emit(DeviceEventKind::ResetResolver);
            }
            DeviceMessage::ResetToState(state) => {
                if self.history.set_baseline(state.clone()) {
                    debug!(device_id = %self.config.device_id, "Device baseline set");
                    self.recalculate();
                } else {
                    info!(device_id = %self.config.device_id, "Converging from reported device state");
                    self.converge_from(Some(&state));
                }
                self.emit(DeviceEventKind::ResetResolver);
            }
            DeviceMessage::RecalcDiff => {
                self.recalc_current();
            }
            DeviceMessage::SetAddressState { address, state } => {
                let Some(tracker) = self.tracker.as_mut() else {
                    trace!(device_id = %self.config.device_id, %address, "Feedback ignored, no tracker");
                    return;
                };
                match tracker.update_state(&address, state) {
                    Some(TrackerSignal::Blocked) => {
                        info!(device_id = %self.config.device_id, %address, "Address taken over, re-diffing");
                        self.recalc_current();
                    }
                    Some(TrackerSignal::Released) => {
                        debug!(device_id = %self.config.device_id, %address, "Address released");
                        self.recalculate();
                    }
                    None => {}
                }
            }
            DeviceMessage::GetCurrentState { response } => {
                let _ = response.send(self.history.current_state().cloned());
            }
            DeviceMessage::BatchExecuted(report) => {
                self.handle_report(report);
            }
        }
    }

    /// Send what moves the device from `old` to the current target, then
    /// re-diff the queue
    fn converge_from(&mut self, old: Option<&D::State>) {
        let result = {
            let mut diff = masked_diff(self.device.as_ref(), self.tracker.as_ref());
            self.history.diff_current(old, &mut diff)
        };
        match result {
            Some(Ok(commands)) => self.dispatch(commands),
            Some(Err(e)) => warn!(device_id = %self.config.device_id, "Failed to diff current state: {}", e),
            None => debug!(device_id = %self.config.device_id, "Nothing executed yet, nothing to converge"),
        }
        self.recalculate();
    }

    /// Re-diff the current target against what the device holds now
    fn recalc_current(&mut self) {
        let Some(current) = self.history.current_state().cloned() else {
            return;
        };
        self.converge_from(Some(&current));
    }

    fn recalculate(&mut self) {
        let failures = {
            let mut diff = masked_diff(self.device.as_ref(), self.tracker.as_ref());
            self.history.recalculate(&mut diff)
        };
        for (time, e) in failures {
            self.emit(DeviceEventKind::Warning(format!("Dropped state at {}: {}", time, e)));
        }
    }

    fn handle_report(&self, report: ExecutionReport) {
        let options = &self.config.options;

        for timing in report.timings {
            let sent_ms = timing.sent_delay().as_millis() as u64;
            let fulfilled_ms = timing.fulfilled_delay().as_millis() as u64;

            if let Some(err) = timing.error {
                self.emit(DeviceEventKind::CommandError(err));
            }
            if options.limit_slow_sent_command.is_some_and(|limit| sent_ms > limit) {
                warn!(device_id = %self.config.device_id, context = %timing.context, sent_ms, "Slow sent command");
                self.emit(DeviceEventKind::SlowSentCommand {
                    context: timing.context.clone(),
                    timeline_obj_id: timing.timeline_obj_id.clone(),
                    delay_ms: sent_ms,
                });
            }
            if options
                .limit_slow_fulfilled_command
                .is_some_and(|limit| fulfilled_ms > limit)
            {
                warn!(device_id = %self.config.device_id, context = %timing.context, fulfilled_ms, "Slow fulfilled command");
                self.emit(DeviceEventKind::SlowFulfilledCommand {
                    context: timing.context.clone(),
                    timeline_obj_id: timing.timeline_obj_id.clone(),
                    delay_ms: fulfilled_ms,
                });
            }
            if options.report_all_commands {
                self.emit(DeviceEventKind::CommandReport {
                    context: timing.context,
                    timeline_obj_id: timing.timeline_obj_id,
                    sent_delay_ms: sent_ms,
                    fulfilled_delay_ms: fulfilled_ms,
                });
            }
        }
    }
}

async fn wait_until(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
