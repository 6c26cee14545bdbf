//! Abstract device - reports what a device would be told, nothing more
//!
//! Useful for testing timelines and mappings without hardware. Each layer
//! becomes one entry; entries are added, changed and removed as the
//! timeline moves.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{Converted, Device, DeviceContext, DeviceStatus, Transport};
use crate::command::CommandWithContext;
use crate::error::{CommandError, ConversionError, DiffError};
use crate::timeline::{resolve_mapping, Mappings, MappingOptions, TimelineContent, TimelineState};

/// Free-form content; every key except `deviceType` is kept
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbstractContent {
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbstractMapping {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbstractLayer {
    pub id: String,
    pub content: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbstractState {
    pub layers: BTreeMap<String, AbstractLayer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AbstractCommand {
    AddedAbstract {
        layer: String,
        content: BTreeMap<String, Value>,
    },
    ChangedAbstract {
        layer: String,
        content: BTreeMap<String, Value>,
    },
    RemovedAbstract {
        layer: String,
    },
}

pub struct AbstractDevice {
    ctx: DeviceContext<AbstractState, ()>,
    transport: Arc<dyn Transport>,
}

impl AbstractDevice {
    pub fn new(ctx: DeviceContext<AbstractState, ()>, transport: Arc<dyn Transport>) -> Self {
        Self { ctx, transport }
    }
}

#[async_trait]
impl Device for AbstractDevice {
    type State = AbstractState;
    type Command = AbstractCommand;
    type AddressState = ();

    async fn init(&self) -> anyhow::Result<()> {
        self.transport.connect().await?;
        info!("✅ Abstract device '{}' ready", self.ctx.device_id());
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
        DeviceStatus::good()
    }

    fn convert_timeline_state(
        &self,
        state: &TimelineState,
        mappings: &Mappings,
    ) -> Result<Converted<AbstractState, ()>, ConversionError> {
        let mut device_state = AbstractState::default();

        for (layer_name, layer) in &state.layers {
            let TimelineContent::Abstract(content) = &layer.content else {
                continue;
            };
            let Some((mapping, _)) = resolve_mapping(mappings, layer_name, layer) else {
                continue;
            };
            if !matches!(mapping.options, MappingOptions::Abstract(_)) {
                continue;
            }
            device_state.layers.insert(
                layer_name.clone(),
                AbstractLayer {
                    id: layer.id.clone(),
                    content: content.fields.clone(),
                },
            );
        }

        Ok(Converted::state_only(device_state))
    }

    /// Removals first, then additions and changes, each in layer order.
    /// A missing old state is treated as an empty device.
    fn diff_states(
        &self,
        old: Option<&AbstractState>,
        new: &AbstractState,
        _mappings: &Mappings,
        _time: i64,
    ) -> Result<Vec<CommandWithContext<AbstractCommand>>, DiffError> {
        let empty = AbstractState::default();
        let old = old.unwrap_or(&empty);
        let mut commands = Vec::new();

        for (layer, old_layer) in &old.layers {
            if !new.layers.contains_key(layer) {
                commands.push(CommandWithContext::new(
                    AbstractCommand::RemovedAbstract {
                        layer: layer.clone(),
                    },
                    "removed",
                    &old_layer.id,
                ));
            }
        }

        for (layer, new_layer) in &new.layers {
            match old.layers.get(layer) {
                None => commands.push(CommandWithContext::new(
                    AbstractCommand::AddedAbstract {
                        layer: layer.clone(),
                        content: new_layer.content.clone(),
                    },
                    "added",
                    &new_layer.id,
                )),
                Some(old_layer) if old_layer != new_layer => commands.push(CommandWithContext::new(
                    AbstractCommand::ChangedAbstract {
                        layer: layer.clone(),
                        content: new_layer.content.clone(),
                    },
                    "changed",
                    &new_layer.id,
                )),
                Some(_) => {}
            }
        }

        Ok(commands)
    }

    async fn send_command(&self, command: &CommandWithContext<AbstractCommand>) -> Result<(), CommandError> {
        debug!(
            device_id = %self.ctx.device_id(),
            context = %command.context,
            "Abstract command"
        );
        let payload = serde_json::to_value(&command.command).map_err(|e| CommandError::from_command(e, command))?;
        self.transport
            .send(payload)
            .await
            .map_err(|e| CommandError::from_command(e, command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::RecordingTransport;
    use crate::service::clock::DeviceClock;
    use crate::timeline::{Mapping, ResolvedLayer};
    use serde_json::json;

    fn device() -> (AbstractDevice, Arc<RecordingTransport>) {
        let (ctx, _rx, _events) = DeviceContext::channel("abstract0", Arc::new(DeviceClock::local()));
        let transport = Arc::new(RecordingTransport::new("abstract0"));
        (AbstractDevice::new(ctx, transport.clone()), transport)
    }

    fn mappings() -> Mappings {
        let mut mappings = Mappings::new();
        for layer in ["a", "b"] {
            mappings.insert(
                layer.into(),
                Mapping::new("abstract0", MappingOptions::Abstract(AbstractMapping::default())),
            );
        }
        mappings
    }

    fn content(name: &str) -> TimelineContent {
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), json!(name));
        TimelineContent::Abstract(AbstractContent { fields })
    }

    fn state(layers: &[(&str, &str, &str)]) -> AbstractState {
        let (device, _) = device();
        let mut timeline = TimelineState::new(0);
        for (layer, id, name) in layers {
            timeline = timeline.with_layer(*layer, ResolvedLayer::new(*id, content(name)));
        }
        device.convert_timeline_state(&timeline, &mappings()).unwrap().device_state
    }

    #[test]
    fn test_unmapped_layers_ignored() {
        let (device, _) = device();
        let timeline = TimelineState::new(0)
            .with_layer("a", ResolvedLayer::new("obj0", content("x")))
            .with_layer("unmapped", ResolvedLayer::new("obj1", content("y")));
        let converted = device.convert_timeline_state(&timeline, &mappings()).unwrap();
        assert_eq!(converted.device_state.layers.len(), 1);
        assert!(converted.address_states.is_empty());
    }

    #[test]
    fn test_diff_add_change_remove() {
        let (device, _) = device();
        let first = state(&[("a", "obj0", "x")]);
        let commands = device.diff_states(None, &first, &mappings(), 0).unwrap();
        assert!(matches!(commands[0].command, AbstractCommand::AddedAbstract { .. }));

        let second = state(&[("a", "obj0", "y"), ("b", "obj1", "z")]);
        let commands = device.diff_states(Some(&first), &second, &mappings(), 0).unwrap();
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[0].command, AbstractCommand::ChangedAbstract { .. }));
        assert!(matches!(commands[1].command, AbstractCommand::AddedAbstract { .. }));

        let third = state(&[("b", "obj1", "z")]);
        let commands = device.diff_states(Some(&second), &third, &mappings(), 0).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].timeline_obj_id, "obj0");
        assert!(matches!(commands[0].command, AbstractCommand::RemovedAbstract { .. }));

        assert!(device.diff_states(Some(&third), &third, &mappings(), 0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_command_uses_transport() {
        let (device, transport) = device();
        device.init().await.unwrap();

        let cmd = CommandWithContext::new(AbstractCommand::RemovedAbstract { layer: "a".into() }, "removed", "obj0");
        device.send_command(&cmd).await.unwrap();
        assert_eq!(transport.sent(), vec![json!({"type": "removedAbstract", "layer": "a"})]);

        transport.reject_containing("removedAbstract");
        let err = device.send_command(&cmd).await.unwrap_err();
        assert_eq!(err.timeline_obj_id, "obj0");
    }
}
