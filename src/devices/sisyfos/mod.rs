//! Sisyfos audio mixer
//!
//! The mixer can also be operated from its own UI, so channels are tracked
//! as shared-control addresses. The transport pushes feedback:
//! - `{"type": "state", "channels": {..}}` full mixer state after (re)connect
//! - `{"type": "channel", "index": n, "channel": {..}}` one channel changed
//! - `{"type": "mixerOnline", "online": bool}` audio mixer reachability

mod state;

pub use state::{channel_address, convert_timeline_state, SisyfosChannel, SisyfosControl, SisyfosState};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::{
    payload_str, ActionExecutionResult, Converted, Device, DeviceContext, DeviceStatus, SharedControl, StatusCode,
    Transport,
};
use crate::command::CommandWithContext;
use crate::error::{CommandError, ConversionError, DiffError};
use crate::state::{AddressIndex, AddressState};
use crate::timeline::{Mappings, TimelineState};

/// Per-channel settings carried by timeline objects
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SisyfosChannelOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_pgm: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fader_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visible: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fade_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute_on: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_gain: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_selector: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SisyfosChannelContent {
    #[serde(flatten)]
    pub options: SisyfosChannelOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SisyfosChannelsEntry {
    /// Layer whose channel mapping names the mixer channel
    pub mapped_layer: String,
    #[serde(flatten)]
    pub options: SisyfosChannelOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SisyfosChannelsContent {
    #[serde(default)]
    pub channels: Vec<SisyfosChannelsEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub override_priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SisyfosContent {
    Channel(SisyfosChannelContent),
    Channels(SisyfosChannelsContent),
    TriggerValue { trigger_value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mappingType", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SisyfosMapping {
    Channel {
        channel: u32,
        #[serde(default)]
        set_label_to_layer_name: bool,
        #[serde(default)]
        disable_defaults: bool,
    },
    Channels {
        #[serde(default)]
        disable_defaults: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum SisyfosCommand {
    Resync,
    TogglePgm {
        channel: u32,
        value: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        fade_time: Option<u64>,
    },
    TogglePst {
        channel: u32,
        value: u8,
    },
    SetFader {
        channel: u32,
        level: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        fade_time: Option<u64>,
    },
    Label {
        channel: u32,
        value: String,
    },
    Visible {
        channel: u32,
        value: bool,
    },
    SetMute {
        channel: u32,
        value: bool,
    },
    SetInputGain {
        channel: u32,
        value: f64,
    },
    SetInputSelector {
        channel: u32,
        value: u32,
    },
    SetChannel {
        channel: u32,
        values: SisyfosChannel,
    },
    LoadMixerPreset {
        preset_name: String,
    },
}

/// Messages pushed by the mixer
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum SisyfosFeedback {
    State {
        // Keys stay strings: integer keys don't survive the tag buffering
        #[serde(default)]
        channels: BTreeMap<String, SisyfosChannel>,
    },
    Channel {
        index: u32,
        channel: SisyfosChannel,
    },
    MixerOnline {
        online: bool,
    },
}

/// What the mixer last told us
#[derive(Debug, Default)]
struct MixerState {
    channels: BTreeMap<u32, SisyfosChannel>,
    initialized: bool,
    online: bool,
}

impl MixerState {
    fn device_state(&self) -> SisyfosState {
        SisyfosState {
            channels: self.channels.clone(),
            ..Default::default()
        }
    }
}

fn mixer_status(connected: bool, mixer: &MixerState) -> DeviceStatus {
    let mut status = DeviceStatus::good();
    if !connected {
        status.escalate(StatusCode::Bad, "Not connected");
    }
    if connected && !mixer.initialized {
        status.escalate(StatusCode::Bad, "Sisyfos device connection not initialized");
    }
    if !mixer.online {
        status.escalate(StatusCode::Bad, "Sisyfos has no connection to Audiomixer");
    }
    status
}

pub struct SisyfosDevice {
    ctx: DeviceContext<SisyfosState, SisyfosChannel>,
    transport: Arc<dyn Transport>,
    mixer: Arc<Mutex<MixerState>>,
}

impl SisyfosDevice {
    pub const ACTIONS: &'static [&'static str] = &["reinit", "setSisyfosChannelState", "loadMixerPreset"];

    pub fn new(ctx: DeviceContext<SisyfosState, SisyfosChannel>, transport: Arc<dyn Transport>) -> Self {
        Self {
            ctx,
            transport,
            mixer: Arc::new(Mutex::new(MixerState::default())),
        }
    }

    fn handle_feedback(
        ctx: &DeviceContext<SisyfosState, SisyfosChannel>,
        transport: &Weak<dyn Transport>,
        mixer: &Mutex<MixerState>,
        value: Value,
    ) {
        let feedback: SisyfosFeedback = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(e) => {
                warn!(device_id = %ctx.device_id(), "Ignoring unknown Sisyfos feedback: {}", e);
                return;
            }
        };
        let connected = transport.upgrade().is_some_and(|t| t.is_connected());

        match feedback {
            SisyfosFeedback::State { channels } => {
                let (state, status) = {
                    let mut mixer = mixer.lock();
                    mixer.channels = channels
                        .into_iter()
                        .filter_map(|(index, channel)| Some((index.parse().ok()?, channel)))
                        .collect();
                    mixer.initialized = true;
                    (mixer.device_state(), mixer_status(connected, &mixer))
                };
                info!("🎚️ Sisyfos '{}' initialized ({} channels)", ctx.device_id(), state.channels.len());
                ctx.reset_to_state(state);
                ctx.connection_changed(status);
            }
            SisyfosFeedback::Channel { index, channel } => {
                mixer.lock().channels.insert(index, channel.clone());
                debug!(device_id = %ctx.device_id(), index, "Update address state");
                ctx.set_address_state(
                    channel_address(index),
                    AddressState::observed(vec![AddressIndex::Num(index as i64)], channel),
                );
            }
            SisyfosFeedback::MixerOnline { online } => {
                let status = {
                    let mut mixer = mixer.lock();
                    if mixer.online == online {
                        return;
                    }
                    mixer.online = online;
                    mixer_status(connected, &mixer)
                };
                ctx.connection_changed(status);
            }
        }
    }

    /// Ask the mixer for its full state; it answers with a `state` message
    async fn request_state(&self) -> Result<(), CommandError> {
        self.mixer.lock().initialized = false;
        let payload = serde_json::to_value(&SisyfosCommand::Resync)
            .map_err(|e| CommandError::new(e.to_string(), "resync", ""))?;
        self.transport
            .send(payload)
            .await
            .map_err(|e| CommandError::new(e.to_string(), "resync", ""))
    }

    async fn set_channel_state(&self, payload: Option<&Value>) -> ActionExecutionResult {
        let Some(index) = payload.and_then(|p| p.get("channel")).and_then(Value::as_u64) else {
            return ActionExecutionResult::error("Missing channel");
        };
        // SET_CHANNEL counts from 1
        let Some((index, channel)) = u32::try_from(index)
            .ok()
            .and_then(|i| i.checked_add(1).map(|channel| (i, channel)))
        else {
            return ActionExecutionResult::error(format!("Channel {} out of range", index));
        };

        // Channel from the mixer, reset to its defaults
        let mut values = self.mixer.lock().channels.get(&index).cloned().unwrap_or_default();
        let defaults = SisyfosChannel::with_defaults();
        values.fader_level = defaults.fader_level;
        values.pgm_on = defaults.pgm_on;
        values.pst_on = defaults.pst_on;
        values.visible = defaults.visible;
        values.mute_on = defaults.mute_on;
        values.input_gain = defaults.input_gain;
        values.input_selector = defaults.input_selector;
        values.timeline_obj_ids.clear();

        let command = SisyfosCommand::SetChannel { channel, values };
        match self.send_payload(&command).await {
            Ok(()) => ActionExecutionResult::ok(),
            Err(e) => ActionExecutionResult::error(e),
        }
    }

    async fn load_mixer_preset(&self, payload: Option<&Value>) -> ActionExecutionResult {
        let Some(name) = payload_str(payload, "name").filter(|n| !n.is_empty()) else {
            return ActionExecutionResult::error("Missing name");
        };
        if !self.transport.is_connected() || !self.mixer.lock().online {
            return ActionExecutionResult::error("Not connected");
        }
        let command = SisyfosCommand::LoadMixerPreset {
            preset_name: name.to_string(),
        };
        match self.send_payload(&command).await {
            Ok(()) => ActionExecutionResult::ok(),
            Err(e) => ActionExecutionResult::error(e),
        }
    }

    async fn send_payload(&self, command: &SisyfosCommand) -> Result<(), String> {
        let payload = serde_json::to_value(command).map_err(|e| e.to_string())?;
        self.transport.send(payload).await.map_err(|e| e.to_string())
    }
}

fn commands_for_channel(
    index: u32,
    old: &SisyfosChannel,
    new: &SisyfosChannel,
    commands: &mut Vec<CommandWithContext<SisyfosCommand>>,
) {
    let obj_id = new.timeline_obj_ids.first().map(String::as_str).unwrap_or("");
    let fade_time = new.fade_time.filter(|t| *t > 0);
    let mut push = |command, context: String| commands.push(CommandWithContext::new(command, context, obj_id));

    if let Some(pgm) = new.pgm_on.filter(|v| old.pgm_on != Some(*v)) {
        push(
            SisyfosCommand::TogglePgm {
                channel: index,
                value: pgm,
                fade_time,
            },
            format!("Channel {} pgm goes from {:?} to {}", index, old.pgm_on, pgm),
        );
    }
    if let Some(pst) = new.pst_on.filter(|v| old.pst_on != Some(*v)) {
        push(
            SisyfosCommand::TogglePst { channel: index, value: pst },
            format!("Channel {} pst goes from {:?} to {}", index, old.pst_on, pst),
        );
    }
    if let Some(level) = new.fader_level.filter(|v| old.fader_level != Some(*v)) {
        push(
            SisyfosCommand::SetFader {
                channel: index,
                level,
                fade_time,
            },
            "faderLevel change".to_string(),
        );
    }

    let label = if new.label.is_empty() { &old.label } else { &new.label };
    if !label.is_empty() && *label != old.label {
        push(
            SisyfosCommand::Label {
                channel: index,
                value: label.clone(),
            },
            "set label on fader".to_string(),
        );
    }

    if let Some(visible) = new.visible.filter(|v| old.visible != Some(*v)) {
        push(
            SisyfosCommand::Visible { channel: index, value: visible },
            format!("Channel {} visibility goes from {:?} to {}", index, old.visible, visible),
        );
    }
    if let Some(mute) = new.mute_on.filter(|v| old.mute_on != Some(*v)) {
        push(
            SisyfosCommand::SetMute { channel: index, value: mute },
            format!("Channel {} mute goes from {:?} to {}", index, old.mute_on, mute),
        );
    }
    if let Some(gain) = new.input_gain.filter(|v| old.input_gain != Some(*v)) {
        push(
            SisyfosCommand::SetInputGain { channel: index, value: gain },
            format!("Channel {} inputGain goes from {:?} to {}", index, old.input_gain, gain),
        );
    }
    if let Some(selector) = new.input_selector.filter(|v| old.input_selector != Some(*v)) {
        push(
            SisyfosCommand::SetInputSelector {
                channel: index,
                value: selector,
            },
            format!(
                "Channel {} inputSelector goes from {:?} to {}",
                index, old.input_selector, selector
            ),
        );
    }
}

#[async_trait]
impl Device for SisyfosDevice {
    type State = SisyfosState;
    type Command = SisyfosCommand;
    type AddressState = SisyfosChannel;

    async fn init(&self) -> anyhow::Result<()> {
        let ctx = self.ctx.clone();
        let transport = Arc::downgrade(&self.transport);
        let mixer = self.mixer.clone();
        self.transport.subscribe_feedback(Arc::new(move |value| {
            Self::handle_feedback(&ctx, &transport, &mixer, value);
        }));

        self.transport.connect().await?;
        info!("✅ Sisyfos '{}' connected via '{}'", self.ctx.device_id(), self.transport.name());
        self.ctx.connection_changed(self.status());
        Ok(())
    }

    async fn terminate(&self) -> anyhow::Result<()> {
        self.transport.disconnect().await;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.transport.is_connected()
    }

    fn status(&self) -> DeviceStatus {
        mixer_status(self.transport.is_connected(), &self.mixer.lock())
    }

    fn convert_timeline_state(
        &self,
        state: &TimelineState,
        mappings: &Mappings,
    ) -> Result<Converted<SisyfosState, SisyfosChannel>, ConversionError> {
        convert_timeline_state(state, mappings)
    }

    /// Channels without an old counterpart are skipped: the full mixer
    /// state arrives through `reset_to_state` once the mixer reports it.
    fn diff_states(
        &self,
        old: Option<&SisyfosState>,
        new: &SisyfosState,
        _mappings: &Mappings,
        _time: i64,
    ) -> Result<Vec<CommandWithContext<SisyfosCommand>>, DiffError> {
        let mut commands = Vec::new();

        if new.resync && !old.is_some_and(|o| o.resync) {
            commands.push(CommandWithContext::new(
                SisyfosCommand::Resync,
                "Resyncing with Sisyfos",
                "",
            ));
        }

        let Some(old) = old else {
            return Ok(commands);
        };
        for (index, new_channel) in &new.channels {
            if let Some(old_channel) = old.channels.get(index) {
                commands_for_channel(*index, old_channel, new_channel, &mut commands);
            }
        }

        Ok(commands)
    }

    async fn send_command(&self, command: &CommandWithContext<SisyfosCommand>) -> Result<(), CommandError> {
        debug!(device_id = %self.ctx.device_id(), context = %command.context, "Sisyfos command");
        if command.command == SisyfosCommand::Resync {
            return self.request_state().await;
        }
        self.send_payload(&command.command)
            .await
            .map_err(|e| CommandError::from_command(e, command))
    }

    fn action_ids(&self) -> Vec<&'static str> {
        Self::ACTIONS.to_vec()
    }

    async fn execute_action(&self, action_id: &str, payload: Option<Value>) -> ActionExecutionResult {
        match action_id {
            "reinit" => match self.request_state().await {
                Ok(()) => ActionExecutionResult::ok(),
                Err(e) => ActionExecutionResult::error(e.message),
            },
            "setSisyfosChannelState" => self.set_channel_state(payload.as_ref()).await,
            "loadMixerPreset" => self.load_mixer_preset(payload.as_ref()).await,
            _ => ActionExecutionResult::not_found(action_id),
        }
    }

    fn shared_control(&self) -> Option<Arc<dyn SharedControl<SisyfosState, SisyfosChannel>>> {
        Some(Arc::new(SisyfosControl))
    }
}
