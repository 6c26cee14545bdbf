use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::*;
use crate::command::CommandWithContext;
use crate::devices::abstract_device::{AbstractContent, AbstractMapping};
use crate::devices::{ActionExecutionResult, Converted, Device, DeviceContext, DeviceStatus, SharedControl};
use crate::error::{CommandError, ConversionError, DiffError};
use crate::service::clock::DeviceClock;
use crate::service::events::{DeviceEvent, DeviceEventKind};
use crate::service::executor::ExecutionMode;
use crate::state::AddressState;
use crate::timeline::{
    resolve_mapping, DeviceType, Mapping, MappingOptions, Mappings, ResolvedLayer, TimelineContent,
    TimelineState,
};

type Levels = BTreeMap<String, u32>;

#[derive(Debug, Clone)]
struct SetLevel {
    address: String,
    level: u32,
}

/// What the device saw, shared with the test body
#[derive(Default)]
struct Probe {
    sent: Mutex<Vec<(String, u32, i64)>>,
    ctx: Mutex<Option<DeviceContext<Levels, u32>>>,
}

impl Probe {
    fn sent(&self) -> Vec<(String, u32)> {
        self.sent.lock().iter().map(|(a, l, _)| (a.clone(), *l)).collect()
    }

    fn sent_times(&self) -> Vec<i64> {
        self.sent.lock().iter().map(|(_, _, t)| *t).collect()
    }

    fn feedback(&self, address: &str, level: u32) {
        if let Some(ctx) = self.ctx.lock().as_ref() {
            ctx.set_address_state(address, AddressState::observed(vec![], level));
        }
    }
}

struct FaderControl;

impl SharedControl<Levels, u32> for FaderControl {
    fn apply_address_state(&self, state: &mut Levels, address: &str, address_state: &AddressState<u32>) {
        state.insert(address.to_string(), address_state.state);
    }

    fn diff_address_states(&self, a: &AddressState<u32>, b: &AddressState<u32>) -> bool {
        a.state != b.state
    }
}

/// One fader per mapped layer, level taken from the `level` content field
struct FaderDevice {
    ctx: DeviceContext<Levels, u32>,
    probe: Arc<Probe>,
    preliminary: u64,
    send_delay: Duration,
}

#[async_trait]
impl Device for FaderDevice {
    type State = Levels;
    type Command = SetLevel;
    type AddressState = u32;

    async fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn terminate(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn connected(&self) -> bool {
        true
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus::good()
    }

    fn convert_timeline_state(
        &self,
        state: &TimelineState,
        mappings: &Mappings,
    ) -> Result<Converted<Levels, u32>, ConversionError> {
        let mut converted = Converted::state_only(Levels::new());
        for (layer_name, layer) in &state.layers {
            let TimelineContent::Abstract(content) = &layer.content else {
                continue;
            };
            if resolve_mapping(mappings, layer_name, layer).is_none() {
                continue;
            }
            let level = match content.fields.get("level") {
                None => 0,
                Some(value) => value
                    .as_u64()
                    .and_then(|l| u32::try_from(l).ok())
                    .ok_or_else(|| ConversionError::InvalidLayer {
                        layer: layer_name.clone(),
                        reason: format!("level {} is not a fader level", value),
                    })?,
            };
            converted.device_state.insert(layer_name.clone(), level);
            converted
                .address_states
                .insert(layer_name.clone(), AddressState::new(&layer.id, vec![], level));
        }
        Ok(converted)
    }

    fn diff_states(
        &self,
        old: Option<&Levels>,
        new: &Levels,
        _mappings: &Mappings,
        _time: i64,
    ) -> Result<Vec<CommandWithContext<SetLevel>>, DiffError> {
        Ok(new
            .iter()
            .filter(|(address, level)| old.and_then(|o| o.get(*address)) != Some(*level))
            .map(|(address, level)| {
                CommandWithContext::new(
                    SetLevel {
                        address: address.clone(),
                        level: *level,
                    },
                    "level changed",
                    address,
                )
                .with_preliminary(self.preliminary)
            })
            .collect())
    }

    async fn send_command(&self, command: &CommandWithContext<SetLevel>) -> Result<(), CommandError> {
        let now = self.ctx.current_time();
        self.probe
            .sent
            .lock()
            .push((command.command.address.clone(), command.command.level, now));
        tokio::time::sleep(self.send_delay).await;
        Ok(())
    }

    fn action_ids(&self) -> Vec<&'static str> {
        vec!["ping"]
    }

    async fn execute_action(&self, action_id: &str, _payload: Option<serde_json::Value>) -> ActionExecutionResult {
        match action_id {
            "ping" => ActionExecutionResult::ok(),
            _ => ActionExecutionResult::not_found(action_id),
        }
    }

    fn shared_control(&self) -> Option<Arc<dyn SharedControl<Levels, u32>>> {
        Some(Arc::new(FaderControl))
    }
}

struct Harness {
    handle: DeviceInstanceHandle,
    probe: Arc<Probe>,
    events: mpsc::UnboundedReceiver<DeviceEvent>,
    clock: Arc<DeviceClock>,
}

fn spawn_with(options: InstanceOptions, preliminary: u64, send_delay: Duration) -> Harness {
    let clock = Arc::new(DeviceClock::local());
    let (events_tx, events) = mpsc::unbounded_channel();
    let probe = Arc::new(Probe::default());
    let config = InstanceConfig {
        device_id: "fader0".into(),
        device_type: DeviceType::Abstract,
        device_name: "Fader test".into(),
        can_connect: false,
        execution_mode: ExecutionMode::Salvo,
        options,
    };

    let device_probe = probe.clone();
    let handle = DeviceInstance::<FaderDevice>::spawn(config, clock.clone(), events_tx, move |ctx| {
        *device_probe.ctx.lock() = Some(ctx.clone());
        FaderDevice {
            ctx,
            probe: device_probe,
            preliminary,
            send_delay,
        }
    });

    Harness {
        handle,
        probe,
        events,
        clock,
    }
}

fn spawn() -> Harness {
    spawn_with(InstanceOptions::default(), 0, Duration::ZERO)
}

fn mappings(device_id: &str) -> Arc<Mappings> {
    let mut mappings = Mappings::new();
    mappings.insert(
        "fader_a".into(),
        Mapping::new(device_id, MappingOptions::Abstract(AbstractMapping::default())),
    );
    Arc::new(mappings)
}

fn fader_state(time: i64, obj_id: &str, level: u32) -> Arc<TimelineState> {
    fader_state_with(time, obj_id, json!(level))
}

fn fader_state_with(time: i64, obj_id: &str, level: serde_json::Value) -> Arc<TimelineState> {
    let mut fields = BTreeMap::new();
    fields.insert("level".to_string(), level);
    Arc::new(TimelineState::new(time).with_layer(
        "fader_a",
        ResolvedLayer::new(obj_id, TimelineContent::Abstract(AbstractContent { fields })),
    ))
}

async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn drain(events: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEventKind> {
    let mut kinds = Vec::new();
    while let Ok(event) = events.try_recv() {
        kinds.push(event.kind);
    }
    kinds
}

#[tokio::test(start_paused = true)]
async fn test_state_executes_at_its_time() {
    let h = spawn();
    let time = h.clock.now() + 1000;
    h.handle.handle_state(fader_state(time, "obj0", 5), mappings("fader0"));

    advance(900).await;
    assert!(h.probe.sent().is_empty());

    advance(200).await;
    assert_eq!(h.probe.sent(), vec![("fader_a".to_string(), 5)]);
    let sent_at = h.probe.sent_times()[0];
    assert!((sent_at - time).abs() <= 5, "sent at {} for {}", sent_at, time);
}

#[tokio::test(start_paused = true)]
async fn test_preliminary_command_sent_early() {
    let h = spawn_with(InstanceOptions::default(), 300, Duration::ZERO);
    let time = h.clock.now() + 1000;
    h.handle.handle_state(fader_state(time, "obj0", 5), mappings("fader0"));

    advance(600).await;
    assert!(h.probe.sent().is_empty());

    advance(200).await;
    assert_eq!(h.probe.sent().len(), 1);
    let sent_at = h.probe.sent_times()[0];
    assert!((sent_at - (time - 300)).abs() <= 5, "sent at {} for {}", sent_at, time);
}

#[tokio::test(start_paused = true)]
async fn test_clear_future_drops_queued_state() {
    let h = spawn();
    let now = h.clock.now();
    h.handle.handle_state(fader_state(now + 500, "obj0", 5), mappings("fader0"));
    h.handle.handle_state(fader_state(now + 1000, "obj0", 6), mappings("fader0"));
    h.handle.clear_future(now + 1000);

    let details = h.handle.get_details().await.unwrap();
    assert_eq!(details.queued_states, 1);

    advance(2000).await;
    assert_eq!(h.probe.sent(), vec![("fader_a".to_string(), 5)]);
}

#[tokio::test(start_paused = true)]
async fn test_later_state_supersedes_queue() {
    let h = spawn();
    let now = h.clock.now();
    h.handle.handle_state(fader_state(now + 1000, "obj0", 5), mappings("fader0"));
    h.handle.handle_state(fader_state(now + 500, "obj1", 7), mappings("fader0"));

    advance(2000).await;
    assert_eq!(h.probe.sent(), vec![("fader_a".to_string(), 7)]);
}

#[tokio::test(start_paused = true)]
async fn test_taken_over_address_left_alone() {
    let h = spawn();
    let now = h.clock.now();
    h.handle.handle_state(fader_state(now + 100, "obj0", 5), mappings("fader0"));
    advance(200).await;
    assert_eq!(h.probe.sent().len(), 1);

    // Operator pulls the fader
    h.probe.feedback("fader_a", 9);
    advance(10).await;
    assert_eq!(h.probe.sent().len(), 1);

    // Same object with new content: keep yielding
    h.handle.handle_state(fader_state(now + 400, "obj0", 6), mappings("fader0"));
    advance(400).await;
    assert_eq!(h.probe.sent().len(), 1);

    // New object: take the fader back
    h.handle.handle_state(fader_state(now + 1000, "obj1", 7), mappings("fader0"));
    advance(500).await;
    assert_eq!(h.probe.sent(), vec![("fader_a".to_string(), 5), ("fader_a".to_string(), 7)]);
}

#[tokio::test(start_paused = true)]
async fn test_shared_control_can_be_disabled() {
    let options = InstanceOptions {
        disable_shared_hardware_control: true,
        ..Default::default()
    };
    let h = spawn_with(options, 0, Duration::ZERO);
    let now = h.clock.now();
    h.handle.handle_state(fader_state(now + 100, "obj0", 5), mappings("fader0"));
    advance(200).await;

    h.probe.feedback("fader_a", 9);
    h.handle.handle_state(fader_state(now + 400, "obj2", 6), mappings("fader0"));
    advance(400).await;
    assert_eq!(h.probe.sent(), vec![("fader_a".to_string(), 5), ("fader_a".to_string(), 6)]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_state_resends_current_target() {
    let mut h = spawn();
    let now = h.clock.now();
    h.handle.handle_state(fader_state(now + 100, "obj0", 5), mappings("fader0"));
    advance(200).await;

    drain(&mut h.events);
    if let Some(ctx) = h.probe.ctx.lock().as_ref() {
        ctx.reset_state();
    }
    advance(10).await;

    assert_eq!(h.probe.sent(), vec![("fader_a".to_string(), 5), ("fader_a".to_string(), 5)]);
    assert!(drain(&mut h.events).contains(&DeviceEventKind::ResetResolver));
}

#[tokio::test(start_paused = true)]
async fn test_conversion_failure_keeps_baseline() {
    let mut h = spawn();
    let now = h.clock.now();
    h.handle.handle_state(fader_state(now + 100, "obj0", 5), mappings("fader0"));
    advance(150).await;
    drain(&mut h.events);

    h.handle
        .handle_state(fader_state_with(now + 200, "obj0", json!("loud")), mappings("fader0"));
    assert_eq!(h.handle.get_details().await.unwrap().queued_states, 0);
    let kinds = drain(&mut h.events);
    assert!(kinds.iter().any(|k| matches!(
        k,
        DeviceEventKind::Warning(message) if message.contains("Failed to convert") && message.contains("loud")
    )));

    // Still diffed against the executed level 5
    h.handle.handle_state(fader_state(now + 300, "obj0", 5), mappings("fader0"));
    h.handle.handle_state(fader_state(now + 400, "obj0", 8), mappings("fader0"));
    advance(400).await;
    assert_eq!(h.probe.sent(), vec![("fader_a".to_string(), 5), ("fader_a".to_string(), 8)]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_to_state_before_execution_sets_baseline() {
    let mut h = spawn();
    let now = h.clock.now();
    h.handle.handle_state(fader_state(now + 500, "obj0", 5), mappings("fader0"));
    h.handle.handle_state(fader_state(now + 800, "obj0", 7), mappings("fader0"));
    assert_eq!(h.handle.get_details().await.unwrap().queued_states, 2);

    // Device already holds level 5 when it connects
    if let Some(ctx) = h.probe.ctx.lock().as_ref() {
        ctx.reset_to_state(Levels::from([("fader_a".to_string(), 5)]));
    }
    advance(10).await;
    assert!(drain(&mut h.events).contains(&DeviceEventKind::ResetResolver));

    advance(1000).await;
    assert_eq!(h.probe.sent(), vec![("fader_a".to_string(), 7)]);
}

#[tokio::test(start_paused = true)]
async fn test_reset_to_state_after_execution_converges() {
    let mut h = spawn();
    let now = h.clock.now();
    h.handle.handle_state(fader_state(now + 100, "obj0", 5), mappings("fader0"));
    advance(150).await;
    drain(&mut h.events);

    // Device lost its state and reports level 2; target is still 5
    if let Some(ctx) = h.probe.ctx.lock().as_ref() {
        ctx.reset_to_state(Levels::from([("fader_a".to_string(), 2)]));
    }
    advance(10).await;
    assert_eq!(h.probe.sent(), vec![("fader_a".to_string(), 5), ("fader_a".to_string(), 5)]);
    assert!(drain(&mut h.events).contains(&DeviceEventKind::ResetResolver));

    // Reporting the target itself sends nothing
    if let Some(ctx) = h.probe.ctx.lock().as_ref() {
        ctx.reset_to_state(Levels::from([("fader_a".to_string(), 5)]));
    }
    advance(10).await;
    assert_eq!(h.probe.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_slow_command_reported() {
    let options = InstanceOptions {
        limit_slow_fulfilled_command: Some(20),
        report_all_commands: true,
        ..Default::default()
    };
    let mut h = spawn_with(options, 0, Duration::from_millis(50));
    let now = h.clock.now();
    h.handle.handle_state(fader_state(now + 100, "obj0", 5), mappings("fader0"));
    advance(300).await;

    let kinds = drain(&mut h.events);
    assert!(kinds.iter().any(|k| matches!(
        k,
        DeviceEventKind::SlowFulfilledCommand { timeline_obj_id, delay_ms, .. }
            if timeline_obj_id == "fader_a" && *delay_ms >= 50
    )));
    assert!(kinds
        .iter()
        .any(|k| matches!(k, DeviceEventKind::CommandReport { .. })));
    assert!(!kinds
        .iter()
        .any(|k| matches!(k, DeviceEventKind::SlowSentCommand { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_status_active_follows_mappings() {
    let h = spawn();
    let now = h.clock.now();

    h.handle.handle_state(fader_state(now + 100, "obj0", 5), mappings("other"));
    assert!(!h.handle.get_status().await.unwrap().active);

    h.handle.handle_state(fader_state(now + 200, "obj0", 5), mappings("fader0"));
    assert!(h.handle.get_status().await.unwrap().active);
}

#[tokio::test(start_paused = true)]
async fn test_actions() {
    let h = spawn();
    assert!(h.handle.execute_action("ping", None).await.is_ok());

    let result = h.handle.execute_action("explode", None).await;
    assert!(!result.is_ok());
    assert_eq!(result.response.as_deref(), Some("Action \"explode\" not found"));

    let details = h.handle.get_details().await.unwrap();
    assert_eq!(details.actions, vec!["ping".to_string()]);
    assert_eq!(details.device_name, "Fader test");
}

#[tokio::test(start_paused = true)]
async fn test_terminate_stops_instance() {
    let h = spawn();
    h.handle.terminate().await.unwrap();
    advance(10).await;

    assert!(!h.handle.is_alive());
    assert!(h.handle.get_status().await.is_none());
    assert!(!h.handle.execute_action("ping", None).await.is_ok());
    // Second terminate is a no-op
    h.handle.terminate().await.unwrap();
}
