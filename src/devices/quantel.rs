//! Quantel video server
//!
//! Each mapped port plays clips on one or more server channels. Clip
//! fragments are loaded ahead of the play time (preliminary lead time) and
//! every port gets a queue of its own so one slow port does not hold up the
//! others. All port releases are sent before anything else.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use super::{ActionExecutionResult, Converted, Device, DeviceContext, DeviceStatus, Transport};
use crate::command::CommandWithContext;
use crate::error::{CommandError, ConversionError, DiffError};
use crate::timeline::{resolve_mapping, MappingOptions, Mappings, TimelineContent, TimelineState};

/// Lead time we aim for when preparing a clip
pub const IDEAL_PREPARE_TIME: i64 = 1000;
/// Minimum distance between the previous state and preparation of the next
pub const PREPARE_TIME_WAIT: i64 = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantelMapping {
    pub port_id: String,
    pub channel_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuantelContent {
    pub title: Option<String>,
    pub guid: Option<String>,
    pub playing: Option<bool>,
    pub pause_time: Option<i64>,
    pub in_point: Option<i64>,
    pub length: Option<i64>,
    pub not_on_air: Option<bool>,
    pub no_starttime: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantelClip {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guid: Option<String>,
    pub playing: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_time: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_point: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub play_time: Option<i64>,
}

impl QuantelClip {
    fn same_media(&self, other: &QuantelClip) -> bool {
        self.title == other.title && self.guid == other.guid
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantelLookaheadClip {
    pub title: Option<String>,
    pub guid: Option<String>,
    pub timeline_obj_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuantelPort {
    /// Sorted, unique
    pub channels: Vec<u32>,
    pub timeline_obj_id: String,
    pub clip: Option<QuantelClip>,
    pub lookahead_clip: Option<QuantelLookaheadClip>,
    /// The clip comes from a lookahead object
    pub lookahead: bool,
    pub not_on_air: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuantelState {
    pub time: i64,
    pub ports: BTreeMap<String, QuantelPort>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QuantelCommand {
    SetupPort {
        port_id: String,
        channel: u32,
    },
    ReleasePort {
        port_id: String,
    },
    LoadClipFragments {
        port_id: String,
        clip: QuantelClip,
        time_of_play: i64,
        from_lookahead: bool,
        allowed_to_prepare_jump: bool,
    },
    PlayClip {
        port_id: String,
        clip: QuantelClip,
        from_lookahead: bool,
    },
    PauseClip {
        port_id: String,
        clip: QuantelClip,
        from_lookahead: bool,
    },
    ClearClip {
        port_id: String,
        from_lookahead: bool,
    },
}

impl QuantelCommand {
    fn name(&self) -> &'static str {
        match self {
            QuantelCommand::SetupPort { .. } => "setupPort",
            QuantelCommand::ReleasePort { .. } => "releasePort",
            QuantelCommand::LoadClipFragments { .. } => "loadClipFragments",
            QuantelCommand::PlayClip { .. } => "playClip",
            QuantelCommand::PauseClip { .. } => "pauseClip",
            QuantelCommand::ClearClip { .. } => "clearClip",
        }
    }

    pub fn port_id(&self) -> &str {
        match self {
            QuantelCommand::SetupPort { port_id, .. }
            | QuantelCommand::ReleasePort { port_id }
            | QuantelCommand::LoadClipFragments { port_id, .. }
            | QuantelCommand::PlayClip { port_id, .. }
            | QuantelCommand::PauseClip { port_id, .. }
            | QuantelCommand::ClearClip { port_id, .. } => port_id,
        }
    }
}

/// Ports and their channels, from the mappings
fn mapped_ports(mappings: &Mappings) -> BTreeMap<String, Vec<u32>> {
    let mut ports: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
    for mapping in mappings.values() {
        if let MappingOptions::Quantel(q) = &mapping.options {
            ports.entry(q.port_id.clone()).or_default().insert(q.channel_id);
        }
    }
    ports
        .into_iter()
        .map(|(port, channels)| (port, channels.into_iter().collect()))
        .collect()
}

/// How long before `time` preparation commands go out
fn prepare_lead_time(old_time: Option<i64>, time: i64) -> u64 {
    let lead = match old_time {
        Some(old_time) => (time - old_time - PREPARE_TIME_WAIT).min(IDEAL_PREPARE_TIME),
        None => IDEAL_PREPARE_TIME,
    };
    lead.max(0) as u64
}

pub struct QuantelDevice {
    ctx: DeviceContext<QuantelState, ()>,
    transport: Arc<dyn Transport>,
}

impl QuantelDevice {
    pub const ACTIONS: &'static [&'static str] = &["restartGateway", "clearStates"];

    pub fn new(ctx: DeviceContext<QuantelState, ()>, transport: Arc<dyn Transport>) -> Self {
        Self { ctx, transport }
    }

    async fn restart_gateway(&self) -> ActionExecutionResult {
        if !self.transport.is_connected() {
            return ActionExecutionResult::error("Quantel Gateway not connected");
        }
        self.transport.disconnect().await;
        match self.transport.connect().await {
            Ok(()) => {
                self.ctx.connection_changed(self.status());
                ActionExecutionResult::ok()
            }
            Err(e) => {
                self.ctx.connection_changed(self.status());
                ActionExecutionResult::error(e.to_string())
            }
        }
    }
}

#[async_trait]
impl Device for QuantelDevice {
    type State = QuantelState;
    type Command = QuantelCommand;
    type AddressState = ();

    async fn init(&self) -> anyhow::Result<()> {
        self.transport.connect().await?;
        info!("✅ Quantel '{}' gateway '{}' connected", self.ctx.device_id(), self.transport.name());
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
        if self.transport.is_connected() {
            DeviceStatus::good()
        } else {
            DeviceStatus::bad("Not connected")
        }
    }

    fn convert_timeline_state(
        &self,
        state: &TimelineState,
        mappings: &Mappings,
    ) -> Result<Converted<QuantelState, ()>, ConversionError> {
        let mut device_state = QuantelState {
            time: state.time,
            ports: mapped_ports(mappings)
                .into_iter()
                .map(|(port_id, channels)| {
                    (
                        port_id,
                        QuantelPort {
                            channels,
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        };

        for (layer_name, layer) in &state.layers {
            let TimelineContent::Quantel(content) = &layer.content else {
                continue;
            };
            let Some((mapping, via_lookahead)) = resolve_mapping(mappings, layer_name, layer) else {
                continue;
            };
            let MappingOptions::Quantel(q) = &mapping.options else {
                continue;
            };
            if content.title.is_none() && content.guid.is_none() {
                return Err(ConversionError::InvalidLayer {
                    layer: layer_name.clone(),
                    reason: "clip has neither title nor guid".into(),
                });
            }
            let Some(port) = device_state.ports.get_mut(&q.port_id) else {
                return Err(ConversionError::UnknownTarget {
                    layer: layer_name.clone(),
                    what: "port",
                    id: q.port_id.clone(),
                });
            };

            let is_lookahead = via_lookahead || layer.is_lookahead;
            if is_lookahead {
                port.lookahead_clip = Some(QuantelLookaheadClip {
                    title: content.title.clone(),
                    guid: content.guid.clone(),
                    timeline_obj_id: layer.id.clone(),
                });
                // A real clip wins over the preview
                if port.clip.is_some() {
                    continue;
                }
            }

            port.timeline_obj_id = layer.id.clone();
            port.not_on_air = content.not_on_air.unwrap_or(false) || is_lookahead;
            port.lookahead = is_lookahead;
            port.clip = Some(QuantelClip {
                title: content.title.clone(),
                guid: content.guid.clone(),
                playing: !is_lookahead && content.playing.unwrap_or(true),
                pause_time: content.pause_time,
                in_point: content.in_point,
                length: content.length,
                play_time: if is_lookahead || content.no_starttime.unwrap_or(false) {
                    None
                } else {
                    layer.start
                },
            });
        }

        Ok(Converted::state_only(device_state))
    }

    /// An unknown old state counts as a server with no ports set up.
    fn diff_states(
        &self,
        old: Option<&QuantelState>,
        new: &QuantelState,
        _mappings: &Mappings,
        time: i64,
    ) -> Result<Vec<CommandWithContext<QuantelCommand>>, DiffError> {
        let prepare = prepare_lead_time(old.map(|o| o.time), time);
        let empty = QuantelState::default();
        let old = old.unwrap_or(&empty);

        let mut high: Vec<CommandWithContext<QuantelCommand>> = Vec::new();
        let mut low: Vec<CommandWithContext<QuantelCommand>> = Vec::new();
        let mut seen_clips = BTreeSet::new();

        let mut add = |command: QuantelCommand, obj_id: &str, preliminary: bool, low_priority: bool| {
            let port_id = command.port_id().to_string();
            let mut cwc = CommandWithContext::new(command, "", obj_id).with_queue(port_id);
            cwc.context = format!("{}_{}", cwc.command.name(), obj_id);
            if preliminary {
                cwc = cwc.with_preliminary(prepare);
            }
            if low_priority {
                low.push(cwc);
            } else {
                high.push(cwc);
            }
        };

        let mut preload = Vec::new();
        for (port_id, new_port) in &new.ports {
            let old_port = old.ports.get(port_id);

            if old_port.map_or(true, |o| o.channels != new_port.channels) {
                if let Some(channel) = new_port.channels.first() {
                    add(
                        QuantelCommand::SetupPort {
                            port_id: port_id.clone(),
                            channel: *channel,
                        },
                        &new_port.timeline_obj_id,
                        true,
                        new_port.lookahead,
                    );
                }
            }

            if old_port.map_or(true, |o| o.clip != new_port.clip) {
                match &new_port.clip {
                    Some(clip) => {
                        let key = format!("{}:{:?}_{:?}", port_id, clip.guid, clip.title);
                        if seen_clips.insert(key) {
                            add(
                                QuantelCommand::LoadClipFragments {
                                    port_id: port_id.clone(),
                                    clip: clip.clone(),
                                    time_of_play: time,
                                    from_lookahead: new_port.lookahead,
                                    allowed_to_prepare_jump: true,
                                },
                                &new_port.timeline_obj_id,
                                true,
                                new_port.lookahead,
                            );
                        }
                        let command = if clip.playing {
                            QuantelCommand::PlayClip {
                                port_id: port_id.clone(),
                                clip: clip.clone(),
                                from_lookahead: new_port.lookahead,
                            }
                        } else {
                            QuantelCommand::PauseClip {
                                port_id: port_id.clone(),
                                clip: clip.clone(),
                                from_lookahead: new_port.lookahead,
                            }
                        };
                        add(command, &new_port.timeline_obj_id, false, new_port.lookahead);
                    }
                    None => add(
                        QuantelCommand::ClearClip {
                            port_id: port_id.clone(),
                            from_lookahead: new_port.lookahead,
                        },
                        &new_port.timeline_obj_id,
                        false,
                        new_port.lookahead,
                    ),
                }
            }

            if old_port.map_or(true, |o| o.lookahead_clip != new_port.lookahead_clip) {
                if let Some(la) = &new_port.lookahead_clip {
                    let preview = QuantelClip {
                        title: la.title.clone(),
                        guid: la.guid.clone(),
                        playing: false,
                        pause_time: None,
                        in_point: None,
                        length: None,
                        play_time: None,
                    };
                    if !new_port.clip.as_ref().is_some_and(|c| c.same_media(&preview)) {
                        preload.push((port_id.clone(), preview, la.timeline_obj_id.clone()));
                    }
                }
            }
        }

        for (port_id, old_port) in &old.ports {
            if !new.ports.contains_key(port_id) {
                add(
                    QuantelCommand::ReleasePort {
                        port_id: port_id.clone(),
                    },
                    &old_port.timeline_obj_id,
                    true,
                    old_port.lookahead,
                );
            }
        }

        for (port_id, clip, obj_id) in preload {
            let key = format!("{}:{:?}_{:?}", port_id, clip.guid, clip.title);
            if seen_clips.insert(key) {
                add(
                    QuantelCommand::LoadClipFragments {
                        port_id,
                        clip,
                        time_of_play: time,
                        from_lookahead: true,
                        allowed_to_prepare_jump: false,
                    },
                    &obj_id,
                    true,
                    true,
                );
            }
        }

        high.extend(low);
        // Stable: only moves releases to the front
        high.sort_by_key(|c| !matches!(c.command, QuantelCommand::ReleasePort { .. }));
        Ok(high)
    }

    async fn send_command(&self, command: &CommandWithContext<QuantelCommand>) -> Result<(), CommandError> {
        debug!(device_id = %self.ctx.device_id(), context = %command.context, "Quantel command");
        let payload = serde_json::to_value(&command.command).map_err(|e| CommandError::from_command(e, command))?;
        self.transport
            .send(payload)
            .await
            .map_err(|e| CommandError::from_command(e, command))
    }

    fn action_ids(&self) -> Vec<&'static str> {
        Self::ACTIONS.to_vec()
    }

    async fn execute_action(&self, action_id: &str, _payload: Option<Value>) -> ActionExecutionResult {
        match action_id {
            "restartGateway" => self.restart_gateway().await,
            "clearStates" => {
                self.ctx.reset_state();
                ActionExecutionResult::ok()
            }
            _ => ActionExecutionResult::not_found(action_id),
        }
    }
}
