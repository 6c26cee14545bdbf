//! BBC GSAAS graphics broker
//!
//! Graphics are organised as groups -> channels -> zones. A channel is
//! loaded with a set of scenes, zones on a loaded channel are updated with
//! "take" payloads and cleared with "clear" payloads.
//!
//! Diff ordering: every unload, then every load, then zone updates. An
//! unknown old state is treated as an empty broker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{payload_str, ActionExecutionResult, Converted, Device, DeviceContext, DeviceStatus, Transport};
use crate::command::CommandWithContext;
use crate::error::{CommandError, ConversionError, DiffError};
use crate::timeline::{resolve_mapping, MappingOptions, Mappings, TimelineContent, TimelineState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GsaasControl {
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub priority: i32,
}

/// Scene id plus the zone payloads to apply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GsaasZonePayload {
    pub id: String,
    #[serde(default)]
    pub zones: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GsaasContent {
    Load {
        #[serde(default)]
        control: BTreeMap<String, GsaasControl>,
        #[serde(default)]
        scenes: BTreeMap<String, String>,
    },
    Unload {},
    Update {
        take: GsaasZonePayload,
        clear: GsaasZonePayload,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mappingType", rename_all = "camelCase")]
pub enum GsaasMapping {
    Channel { group: String, channel: String },
    Zone { group: String, channel: String, zone: String },
}

impl GsaasMapping {
    fn group_channel(&self) -> (&str, &str) {
        match self {
            GsaasMapping::Channel { group, channel } | GsaasMapping::Zone { group, channel, .. } => {
                (group, channel)
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GsaasZone {
    pub tl_obj_id: String,
    pub take: GsaasZonePayload,
    pub clear: GsaasZonePayload,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GsaasChannel {
    pub control: BTreeMap<String, GsaasControl>,
    pub scenes: BTreeMap<String, String>,
    /// Object that loaded (or explicitly unloaded) the channel
    pub tl_obj_id: Option<String>,
    pub zones: BTreeMap<String, GsaasZone>,
}

impl GsaasChannel {
    pub fn is_loaded(&self) -> bool {
        !self.scenes.is_empty()
    }
}

/// group -> channel -> state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GsaasState {
    pub groups: BTreeMap<String, BTreeMap<String, GsaasChannel>>,
}

impl GsaasState {
    pub fn channel(&self, group: &str, channel: &str) -> Option<&GsaasChannel> {
        self.groups.get(group)?.get(channel)
    }

    fn channel_mut(&mut self, group: &str, channel: &str) -> &mut GsaasChannel {
        self.groups
            .entry(group.to_string())
            .or_default()
            .entry(channel.to_string())
            .or_default()
    }

    fn channels(&self) -> impl Iterator<Item = (&str, &str, &GsaasChannel)> {
        self.groups
            .iter()
            .flat_map(|(g, channels)| channels.iter().map(move |(c, ch)| (g.as_str(), c.as_str(), ch)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum GsaasCommand {
    Load {
        group: String,
        channel: String,
        control: BTreeMap<String, GsaasControl>,
        scenes: BTreeMap<String, String>,
    },
    Unload {
        group: String,
        channel: String,
    },
    Update {
        group: String,
        channel: String,
        payload: GsaasZonePayload,
    },
}

impl GsaasCommand {
    /// Broker endpoint and request body
    fn request(&self) -> (String, Value) {
        match self {
            GsaasCommand::Load {
                group,
                channel,
                control,
                scenes,
            } => (
                format!("/load/{}/{}", group, channel),
                serde_json::json!({ "control": control, "scenes": scenes }),
            ),
            GsaasCommand::Unload { group, channel } => (format!("/unload/{}/{}", group, channel), Value::Null),
            GsaasCommand::Update { group, channel, payload } => (
                format!("/update/{}/{}", group, channel),
                serde_json::to_value(payload).unwrap_or(Value::Null),
            ),
        }
    }
}

pub struct GsaasDevice {
    ctx: DeviceContext<GsaasState, ()>,
    transport: Arc<dyn Transport>,
}

impl GsaasDevice {
    pub const ACTIONS: &'static [&'static str] = &["resync", "continue", "clearAll", "clearZone"];

    pub fn new(ctx: DeviceContext<GsaasState, ()>, transport: Arc<dyn Transport>) -> Self {
        Self { ctx, transport }
    }

    async fn send_to_broker(&self, endpoint: String, body: Value) -> Result<(), String> {
        debug!(device_id = %self.ctx.device_id(), %endpoint, "GSAAS request");
        self.transport
            .send(serde_json::json!({ "endpoint": endpoint, "body": body }))
            .await
            .map_err(|e| {
                warn!("BBC GSAAS request to '{}' failed: {}", endpoint, e);
                e.to_string()
            })
    }

    async fn continue_zone(&self, payload: Option<&Value>) -> ActionExecutionResult {
        let (Some(group), Some(channel), Some(zone)) = (
            payload_str(payload, "group"),
            payload_str(payload, "channel"),
            payload_str(payload, "zone"),
        ) else {
            return ActionExecutionResult::error("Missing payload");
        };
        match self
            .send_to_broker(format!("/continue/{}/{}/{}", group, channel, zone), Value::Null)
            .await
        {
            Ok(()) => ActionExecutionResult::ok(),
            Err(e) => ActionExecutionResult::error(format!("Failed to send command to GSAAS broker: {}", e)),
        }
    }

    async fn clear_all(&self, payload: Option<&Value>) -> ActionExecutionResult {
        let (Some(group), Some(channel)) = (payload_str(payload, "group"), payload_str(payload, "channel")) else {
            return ActionExecutionResult::error("Missing payload");
        };
        match self
            .send_to_broker(format!("/clearAll/{}/{}", group, channel), Value::Null)
            .await
        {
            Ok(()) => {
                self.ctx.reset_state();
                ActionExecutionResult::ok()
            }
            Err(e) => ActionExecutionResult::error(format!("Failed to send command to GSAAS broker: {}", e)),
        }
    }

    async fn clear_zone(&self, payload: Option<&Value>) -> ActionExecutionResult {
        let (Some(group), Some(channel), Some(zone)) = (
            payload_str(payload, "group"),
            payload_str(payload, "channel"),
            payload_str(payload, "zone"),
        ) else {
            return ActionExecutionResult::error("Missing payload");
        };

        let Some(mut state) = self.ctx.current_state().await else {
            return ActionExecutionResult::ok();
        };
        let Some(clear) = state
            .channel(group, channel)
            .and_then(|ch| ch.zones.get(zone))
            .map(|z| z.clear.clone())
        else {
            // Nothing on that zone
            return ActionExecutionResult::ok();
        };

        let body = match serde_json::to_value(&clear) {
            Ok(body) => body,
            Err(e) => return ActionExecutionResult::error(e.to_string()),
        };
        match self.send_to_broker(format!("/update/{}/{}", group, channel), body).await {
            Ok(()) => {
                state.channel_mut(group, channel).zones.remove(zone);
                self.ctx.reset_to_state(state);
                ActionExecutionResult::ok()
            }
            Err(e) => ActionExecutionResult::error(format!("Failed to send command to GSAAS broker: {}", e)),
        }
    }
}

#[async_trait]
impl Device for GsaasDevice {
    type State = GsaasState;
    type Command = GsaasCommand;
    type AddressState = ();

    async fn init(&self) -> anyhow::Result<()> {
        self.transport.connect().await?;
        info!("✅ BBC GSAAS '{}' using broker '{}'", self.ctx.device_id(), self.transport.name());
        Ok(())
    }

    async fn terminate(&self) -> anyhow::Result<()> {
        self.transport.disconnect().await;
        Ok(())
    }

    /// Stateless HTTP broker, never "connected"
    fn connected(&self) -> bool {
        false
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::good()
    }

    fn convert_timeline_state(
        &self,
        state: &TimelineState,
        mappings: &Mappings,
    ) -> Result<Converted<GsaasState, ()>, ConversionError> {
        let mut device_state = GsaasState::default();

        for (layer_name, layer) in &state.layers {
            let Some((mapping, _)) = resolve_mapping(mappings, layer_name, layer) else {
                continue;
            };
            let MappingOptions::BbcGsaas(gsaas_mapping) = &mapping.options else {
                continue;
            };
            let (group, channel) = gsaas_mapping.group_channel();
            let ch = device_state.channel_mut(group, channel);

            let TimelineContent::BbcGsaas(content) = &layer.content else {
                continue;
            };
            match (content, gsaas_mapping) {
                (GsaasContent::Load { control, scenes }, GsaasMapping::Channel { .. }) => {
                    ch.control = control.clone();
                    ch.scenes = scenes.clone();
                    ch.tl_obj_id = Some(layer.id.clone());
                }
                (GsaasContent::Unload {}, GsaasMapping::Channel { .. }) => {
                    ch.control.clear();
                    ch.scenes.clear();
                    ch.tl_obj_id = Some(layer.id.clone());
                }
                (GsaasContent::Update { take, clear }, GsaasMapping::Zone { zone, .. }) => {
                    let only_zone = |payload: &GsaasZonePayload| GsaasZonePayload {
                        id: payload.id.clone(),
                        zones: payload
                            .zones
                            .get(zone)
                            .map(|v| BTreeMap::from([(zone.clone(), v.clone())]))
                            .unwrap_or_default(),
                    };
                    ch.zones.insert(
                        zone.clone(),
                        GsaasZone {
                            tl_obj_id: layer.id.clone(),
                            take: only_zone(take),
                            clear: only_zone(clear),
                        },
                    );
                }
                _ => {}
            }
        }

        Ok(Converted::state_only(device_state))
    }

    fn diff_states(
        &self,
        old: Option<&GsaasState>,
        new: &GsaasState,
        _mappings: &Mappings,
        _time: i64,
    ) -> Result<Vec<CommandWithContext<GsaasCommand>>, DiffError> {
        let empty = GsaasState::default();
        let old = old.unwrap_or(&empty);
        let blank = GsaasChannel::default();

        let mut unloads = Vec::new();
        let mut loads = Vec::new();
        let mut updates = Vec::new();

        // Channels that disappeared altogether
        for (group, channel, old_ch) in old.channels() {
            if old_ch.is_loaded() && new.channel(group, channel).is_none() {
                unloads.push(CommandWithContext::new(
                    GsaasCommand::Unload {
                        group: group.to_string(),
                        channel: channel.to_string(),
                    },
                    format!("Channel {} in group {} removed", channel, group),
                    old_ch.tl_obj_id.as_deref().unwrap_or(""),
                ));
            }
        }

        for (group, channel, new_ch) in new.channels() {
            let old_ch = old.channel(group, channel).unwrap_or(&blank);
            let tl_obj_id = new_ch.tl_obj_id.as_deref().unwrap_or("");

            if !new_ch.is_loaded() {
                if old_ch.is_loaded() {
                    unloads.push(CommandWithContext::new(
                        GsaasCommand::Unload {
                            group: group.to_string(),
                            channel: channel.to_string(),
                        },
                        format!("Unloaded scenes for channel {} in group {}", channel, group),
                        new_ch.tl_obj_id.as_deref().or(old_ch.tl_obj_id.as_deref()).unwrap_or(""),
                    ));
                }
                continue;
            }

            let reload =
                !old_ch.is_loaded() || old_ch.scenes != new_ch.scenes || old_ch.control != new_ch.control;
            if reload {
                loads.push(CommandWithContext::new(
                    GsaasCommand::Load {
                        group: group.to_string(),
                        channel: channel.to_string(),
                        control: new_ch.control.clone(),
                        scenes: new_ch.scenes.clone(),
                    },
                    format!("Loaded scenes for channel {} in group {}", channel, group),
                    tl_obj_id,
                ));
            }

            for (zone, new_zone) in &new_ch.zones {
                let changed = match old_ch.zones.get(zone) {
                    Some(old_zone) => old_zone.take != new_zone.take,
                    None => true,
                };
                if reload || changed {
                    updates.push(CommandWithContext::new(
                        GsaasCommand::Update {
                            group: group.to_string(),
                            channel: channel.to_string(),
                            payload: new_zone.take.clone(),
                        },
                        format!("Take zone {} on channel {} in group {}", zone, channel, group),
                        &new_zone.tl_obj_id,
                    ));
                }
            }

            // A reload starts the channel from scratch, nothing to clear
            if !reload {
                for (zone, old_zone) in &old_ch.zones {
                    if !new_ch.zones.contains_key(zone) {
                        updates.push(CommandWithContext::new(
                            GsaasCommand::Update {
                                group: group.to_string(),
                                channel: channel.to_string(),
                                payload: old_zone.clear.clone(),
                            },
                            format!("Clear zone {} on channel {} in group {}", zone, channel, group),
                            &old_zone.tl_obj_id,
                        ));
                    }
                }
            }
        }

        unloads.extend(loads);
        unloads.extend(updates);
        Ok(unloads)
    }

    async fn send_command(&self, command: &CommandWithContext<GsaasCommand>) -> Result<(), CommandError> {
        let (endpoint, body) = command.command.request();
        self.send_to_broker(endpoint, body)
            .await
            .map_err(|e| CommandError::from_command(e, command))
    }

    fn action_ids(&self) -> Vec<&'static str> {
        Self::ACTIONS.to_vec()
    }

    async fn execute_action(&self, action_id: &str, payload: Option<Value>) -> ActionExecutionResult {
        match action_id {
            "resync" => {
                self.ctx.reset_resolver();
                ActionExecutionResult::ok()
            }
            "continue" => self.continue_zone(payload.as_ref()).await,
            "clearAll" => self.clear_all(payload.as_ref()).await,
            "clearZone" => self.clear_zone(payload.as_ref()).await,
            _ => ActionExecutionResult::not_found(action_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::RecordingTransport;
    use crate::service::clock::DeviceClock;
    use crate::service::events::{DeviceEvent, DeviceEventKind};
    use crate::service::instance::DeviceMessage;
    use crate::timeline::{Mapping, ResolvedLayer};
    use proptest::prelude::*;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    type Messages = UnboundedReceiver<DeviceMessage<GsaasState, ()>>;

    fn device() -> (GsaasDevice, Arc<RecordingTransport>, Messages, UnboundedReceiver<DeviceEvent>) {
        let (ctx, messages, events) = DeviceContext::channel("gfx0", Arc::new(DeviceClock::local()));
        let transport = Arc::new(RecordingTransport::new("broker"));
        (GsaasDevice::new(ctx, transport.clone()), transport, messages, events)
    }

    fn mappings() -> Mappings {
        let mut mappings = Mappings::new();
        mappings.insert(
            "gfx_main".into(),
            Mapping::new(
                "gfx0",
                MappingOptions::BbcGsaas(GsaasMapping::Channel {
                    group: "studio".into(),
                    channel: "main".into(),
                }),
            ),
        );
        mappings.insert(
            "gfx_lower".into(),
            Mapping::new(
                "gfx0",
                MappingOptions::BbcGsaas(GsaasMapping::Zone {
                    group: "studio".into(),
                    channel: "main".into(),
                    zone: "lower".into(),
                }),
            ),
        );
        mappings
    }

    fn load_layer(id: &str, scene: &str) -> ResolvedLayer {
        ResolvedLayer::new(
            id,
            TimelineContent::BbcGsaas(GsaasContent::Load {
                control: BTreeMap::new(),
                scenes: BTreeMap::from([("*".to_string(), scene.to_string())]),
            }),
        )
    }

    fn update_layer(id: &str, take: &str) -> ResolvedLayer {
        let payload = |scene: &str, text: &str| GsaasZonePayload {
            id: scene.into(),
            zones: BTreeMap::from([
                ("lower".to_string(), json!({ "text": text })),
                ("upper".to_string(), json!({ "text": "ignored" })),
            ]),
        };
        ResolvedLayer::new(
            id,
            TimelineContent::BbcGsaas(GsaasContent::Update {
                take: payload("take", take),
                clear: payload("clear", ""),
            }),
        )
    }

    fn convert(device: &GsaasDevice, timeline: TimelineState) -> GsaasState {
        device.convert_timeline_state(&timeline, &mappings()).unwrap().device_state
    }

    fn loaded(device: &GsaasDevice) -> GsaasState {
        convert(
            device,
            TimelineState::new(0)
                .with_layer("gfx_main", load_layer("objLoad", "news"))
                .with_layer("gfx_lower", update_layer("objLower", "Jane Doe")),
        )
    }

    #[test]
    fn test_parse_content() {
        let content: TimelineContent = serde_json::from_value(json!({
            "deviceType": "bbcGsaas",
            "type": "update",
            "take": { "id": "t1", "zones": { "lower": { "text": "hi" } } },
            "clear": { "id": "c1" }
        }))
        .unwrap();
        assert!(matches!(content, TimelineContent::BbcGsaas(GsaasContent::Update { .. })));
    }

    #[test]
    fn test_convert_keeps_only_mapped_zone() {
        let (device, ..) = device();
        let state = loaded(&device);
        let ch = state.channel("studio", "main").unwrap();
        assert!(ch.is_loaded());
        assert_eq!(ch.tl_obj_id.as_deref(), Some("objLoad"));
        let zone = &ch.zones["lower"];
        assert_eq!(zone.take.zones.keys().collect::<Vec<_>>(), vec!["lower"]);
        assert_eq!(zone.tl_obj_id, "objLower");
    }

    #[test]
    fn test_empty_to_loaded() {
        let (device, ..) = device();
        let commands = device.diff_states(None, &loaded(&device), &mappings(), 0).unwrap();

        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[0].command, GsaasCommand::Load { .. }));
        assert_eq!(commands[0].timeline_obj_id, "objLoad");
        assert!(matches!(commands[1].command, GsaasCommand::Update { .. }));
        assert_eq!(commands[1].timeline_obj_id, "objLower");
        assert!(!commands.iter().any(|c| matches!(c.command, GsaasCommand::Unload { .. })));
    }

    #[test]
    fn test_full_removal_unloads_once() {
        let (device, ..) = device();
        let old = loaded(&device);
        let commands = device
            .diff_states(Some(&old), &GsaasState::default(), &mappings(), 0)
            .unwrap();

        assert_eq!(commands.len(), 1);
        assert_eq!(
            commands[0].command,
            GsaasCommand::Unload {
                group: "studio".into(),
                channel: "main".into()
            }
        );
        assert_eq!(commands[0].timeline_obj_id, "objLoad");
    }

    #[test]
    fn test_explicit_unload_and_zone_changes() {
        let (device, ..) = device();
        let old = loaded(&device);

        // Zone removed: clear payload, no reload
        let without_zone = convert(
            &device,
            TimelineState::new(0).with_layer("gfx_main", load_layer("objLoad", "news")),
        );
        let commands = device.diff_states(Some(&old), &without_zone, &mappings(), 0).unwrap();
        assert_eq!(commands.len(), 1);
        match &commands[0].command {
            GsaasCommand::Update { payload, .. } => assert_eq!(payload.id, "clear"),
            other => panic!("unexpected command {:?}", other),
        }

        // Explicit unload object
        let unload = ResolvedLayer::new("objUnload", TimelineContent::BbcGsaas(GsaasContent::Unload {}));
        let unloaded = convert(&device, TimelineState::new(0).with_layer("gfx_main", unload));
        let commands = device.diff_states(Some(&old), &unloaded, &mappings(), 0).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].timeline_obj_id, "objUnload");
    }

    #[test]
    fn test_scene_change_reloads_before_updates() {
        let (device, ..) = device();
        let old = loaded(&device);
        let new = convert(
            &device,
            TimelineState::new(0)
                .with_layer("gfx_main", load_layer("objLoad2", "sport"))
                .with_layer("gfx_lower", update_layer("objLower", "Jane Doe")),
        );
        let commands = device.diff_states(Some(&old), &new, &mappings(), 0).unwrap();
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[0].command, GsaasCommand::Load { .. }));
        assert!(matches!(commands[1].command, GsaasCommand::Update { .. }));
    }

    #[tokio::test]
    async fn test_send_command_endpoint() {
        let (device, transport, ..) = device();
        device.init().await.unwrap();
        let cmd = CommandWithContext::new(
            GsaasCommand::Unload {
                group: "studio".into(),
                channel: "main".into(),
            },
            "unload",
            "obj",
        );
        device.send_command(&cmd).await.unwrap();
        assert_eq!(transport.sent()[0]["endpoint"], "/unload/studio/main");
    }

    #[tokio::test]
    async fn test_actions() {
        let (device, transport, mut messages, mut events) = device();
        device.init().await.unwrap();

        assert!(device.execute_action("resync", None).await.is_ok());
        assert!(matches!(events.recv().await.unwrap().kind, DeviceEventKind::ResetResolver));

        let result = device.execute_action("continue", None).await;
        assert_eq!(result.response.as_deref(), Some("Missing payload"));

        let target = json!({"group": "studio", "channel": "main", "zone": "lower"});
        assert!(device.execute_action("continue", Some(target.clone())).await.is_ok());
        assert_eq!(transport.sent()[0]["endpoint"], "/continue/studio/main/lower");

        assert!(device.execute_action("clearAll", Some(target.clone())).await.is_ok());
        assert!(matches!(messages.recv().await.unwrap(), DeviceMessage::ResetState));

        // clearZone asks the instance for the current state
        let state = loaded(&device);
        let answer = tokio::spawn(async move {
            match messages.recv().await {
                Some(DeviceMessage::GetCurrentState { response }) => {
                    let _ = response.send(Some(state));
                }
                other => panic!("unexpected message {:?}", other),
            }
            messages.recv().await
        });
        assert!(device.execute_action("clearZone", Some(target)).await.is_ok());
        match answer.await.unwrap() {
            Some(DeviceMessage::ResetToState(state)) => {
                assert!(state.channel("studio", "main").unwrap().zones.is_empty());
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(transport.sent().last().unwrap()["endpoint"], "/update/studio/main");
    }

    fn state_strategy() -> impl Strategy<Value = GsaasState> {
        let zone = ("[a-c]", "[x-z]").prop_map(|(zone, take)| {
            (
                zone,
                GsaasZone {
                    tl_obj_id: "z".into(),
                    take: GsaasZonePayload {
                        id: take,
                        zones: BTreeMap::new(),
                    },
                    clear: GsaasZonePayload::default(),
                },
            )
        });
        let channel = (
            proptest::collection::btree_map("[a-c]", "[a-c]", 0..3),
            proptest::collection::vec(zone, 0..3),
        )
            .prop_map(|(scenes, zones)| GsaasChannel {
                control: BTreeMap::new(),
                scenes,
                tl_obj_id: Some("obj".into()),
                zones: zones.into_iter().collect(),
            });
        proptest::collection::btree_map("[a-b]", proptest::collection::btree_map("[a-b]", channel, 0..3), 0..3)
            .prop_map(|groups| GsaasState { groups })
    }

    proptest! {
        #[test]
        fn prop_diff_of_equal_states_is_empty(state in state_strategy()) {
            let (device, ..) = device();
            let commands = device.diff_states(Some(&state), &state, &mappings(), 0).unwrap();
            prop_assert!(commands.is_empty());
        }

        #[test]
        fn prop_unloads_precede_loads(old in state_strategy(), new in state_strategy()) {
            let (device, ..) = device();
            let commands = device.diff_states(Some(&old), &new, &mappings(), 0).unwrap();
            let rank = |c: &CommandWithContext<GsaasCommand>| match c.command {
                GsaasCommand::Unload { .. } => 0,
                GsaasCommand::Load { .. } => 1,
                GsaasCommand::Update { .. } => 2,
            };
            prop_assert!(commands.windows(2).all(|w| rank(&w[0]) <= rank(&w[1])));
        }
    }
}
