//! Sisyfos state conversion and address handling
//!
//! One address per mixer channel (`channel.<index>`). The control value of
//! a channel is its trigger value, or the ids of the timeline objects that
//! set it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{SisyfosChannelOptions, SisyfosContent, SisyfosMapping};
use crate::devices::{Converted, SharedControl};
use crate::error::ConversionError;
use crate::state::{AddressIndex, AddressState};
use crate::timeline::{resolve_mapping, Mapping, Mappings, MappingOptions, ResolvedLayer, TimelineContent, TimelineState};

/// One mixer channel. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SisyfosChannel {
    pub fader_level: Option<f64>,
    pub pgm_on: Option<u8>,
    pub pst_on: Option<u8>,
    pub label: String,
    pub visible: Option<bool>,
    pub fade_time: Option<u64>,
    pub mute_on: Option<bool>,
    pub input_gain: Option<f64>,
    pub input_selector: Option<u32>,
    pub trigger_value: Option<String>,
    pub timeline_obj_ids: Vec<String>,
}

impl SisyfosChannel {
    /// Channel at rest: 0 dB, off air, visible, unmuted
    pub fn with_defaults() -> Self {
        Self {
            fader_level: Some(0.75),
            pgm_on: Some(0),
            pst_on: Some(0),
            visible: Some(true),
            mute_on: Some(false),
            input_gain: Some(0.75),
            input_selector: Some(1),
            ..Default::default()
        }
    }

    pub fn control_value(&self) -> String {
        self.trigger_value
            .clone()
            .unwrap_or_else(|| self.timeline_obj_ids.join(","))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SisyfosState {
    pub channels: BTreeMap<u32, SisyfosChannel>,
    /// A layer asked for a full mixer resync
    pub resync: bool,
    /// Global retrigger value
    pub trigger_value: Option<String>,
}

impl SisyfosState {
    fn channel_mut(&mut self, index: u32, with_defaults: bool) -> &mut SisyfosChannel {
        self.channels.entry(index).or_insert_with(|| {
            if with_defaults {
                SisyfosChannel::with_defaults()
            } else {
                SisyfosChannel::default()
            }
        })
    }
}

pub fn channel_address(index: u32) -> String {
    format!("channel.{}", index)
}

/// Channel settings found on one layer, before priority ordering
struct FoundChannel {
    channel: u32,
    override_priority: i32,
    is_lookahead: bool,
    timeline_obj_id: String,
    trigger_value: Option<String>,
    disable_defaults: bool,
    options: SisyfosChannelOptions,
}

pub fn convert_timeline_state(
    state: &TimelineState,
    mappings: &Mappings,
) -> Result<Converted<SisyfosState, SisyfosChannel>, ConversionError> {
    let mut device_state = SisyfosState::default();

    for mapping in mappings.values() {
        let MappingOptions::Sisyfos(SisyfosMapping::Channel {
            channel,
            set_label_to_layer_name,
            disable_defaults,
        }) = &mapping.options
        else {
            continue;
        };
        let ch = device_state.channel_mut(*channel, !disable_defaults);
        if *set_label_to_layer_name {
            if let Some(name) = &mapping.layer_name {
                ch.label = name.clone();
            }
        }
    }

    let mut found = Vec::new();
    for (layer_name, layer) in &state.layers {
        let TimelineContent::Sisyfos(content) = &layer.content else {
            continue;
        };

        match content {
            SisyfosContent::Channel(c) => device_state.resync |= c.resync.unwrap_or(false),
            SisyfosContent::Channels(c) => device_state.resync |= c.resync.unwrap_or(false),
            SisyfosContent::TriggerValue { trigger_value } => {
                device_state.trigger_value = Some(trigger_value.clone());
                continue;
            }
        }

        let Some((mapping, _)) = resolve_mapping(mappings, layer_name, layer) else {
            continue;
        };
        found.extend(channels_from_layer(layer_name, layer, content, mapping, mappings)?);
    }

    // Stable: equal priorities keep layer order
    found.sort_by_key(|f| f.override_priority);

    for f in found {
        let ch = device_state.channel_mut(f.channel, !f.disable_defaults);
        let o = &f.options;

        if let Some(pgm) = o.is_pgm {
            if f.is_lookahead {
                ch.pst_on = Some(pgm);
            } else {
                ch.pgm_on = Some(pgm);
            }
        }
        if o.fader_level.is_some() {
            ch.fader_level = o.fader_level;
        }
        if let Some(label) = o.label.as_ref().filter(|l| !l.is_empty()) {
            ch.label = label.clone();
        }
        if o.visible.is_some() {
            ch.visible = o.visible;
        }
        if o.fade_time.is_some() {
            ch.fade_time = o.fade_time;
        }
        if o.mute_on.is_some() {
            ch.mute_on = o.mute_on;
        }
        if o.input_gain.is_some() {
            ch.input_gain = o.input_gain;
        }
        if o.input_selector.is_some() {
            ch.input_selector = o.input_selector;
        }
        if f.trigger_value.is_some() {
            ch.trigger_value = f.trigger_value;
        }
        ch.timeline_obj_ids.push(f.timeline_obj_id);
    }

    let address_states = device_state
        .channels
        .iter()
        .map(|(index, ch)| {
            (
                channel_address(*index),
                AddressState::new(
                    ch.control_value(),
                    vec![AddressIndex::Num(*index as i64)],
                    ch.clone(),
                ),
            )
        })
        .collect();

    Ok(Converted {
        device_state,
        address_states,
    })
}

fn channels_from_layer(
    layer_name: &str,
    layer: &ResolvedLayer,
    content: &SisyfosContent,
    mapping: &Mapping,
    mappings: &Mappings,
) -> Result<Vec<FoundChannel>, ConversionError> {
    let MappingOptions::Sisyfos(sisyfos_mapping) = &mapping.options else {
        return Ok(Vec::new());
    };

    let found = match (sisyfos_mapping, content) {
        (SisyfosMapping::Channel { channel, disable_defaults, .. }, SisyfosContent::Channel(c)) => {
            vec![FoundChannel {
                channel: *channel,
                override_priority: c.override_priority.unwrap_or(0),
                is_lookahead: layer.is_lookahead,
                timeline_obj_id: layer.id.clone(),
                trigger_value: c.trigger_value.clone(),
                disable_defaults: *disable_defaults,
                options: c.options.clone(),
            }]
        }
        (SisyfosMapping::Channels { disable_defaults }, SisyfosContent::Channels(c)) => {
            let mut found = Vec::with_capacity(c.channels.len());
            for entry in &c.channels {
                let referenced = mappings.get(&entry.mapped_layer).ok_or_else(|| ConversionError::UnknownTarget {
                    layer: layer_name.to_string(),
                    what: "mapped layer",
                    id: entry.mapped_layer.clone(),
                })?;
                let MappingOptions::Sisyfos(SisyfosMapping::Channel { channel, .. }) = &referenced.options else {
                    continue;
                };
                found.push(FoundChannel {
                    channel: *channel,
                    override_priority: c.override_priority.unwrap_or(0),
                    is_lookahead: layer.is_lookahead,
                    timeline_obj_id: layer.id.clone(),
                    trigger_value: c.trigger_value.clone(),
                    disable_defaults: *disable_defaults,
                    options: entry.options.clone(),
                });
            }
            found
        }
        _ => Vec::new(),
    };

    Ok(found)
}

/// Shared control for the mixer: operators move faders on the desk
pub struct SisyfosControl;

impl SharedControl<SisyfosState, SisyfosChannel> for SisyfosControl {
    fn apply_address_state(
        &self,
        state: &mut SisyfosState,
        _address: &str,
        address_state: &AddressState<SisyfosChannel>,
    ) {
        let Some(AddressIndex::Num(index)) = address_state.index.first() else {
            return;
        };
        let Some(ch) = u32::try_from(*index).ok().and_then(|i| state.channels.get_mut(&i)) else {
            return;
        };
        let s = &address_state.state;

        ch.fader_level = s.fader_level.or(ch.fader_level);
        ch.pgm_on = s.pgm_on.or(ch.pgm_on);
        ch.pst_on = s.pst_on.or(ch.pst_on);
        if !s.label.is_empty() {
            ch.label = s.label.clone();
        }
        ch.visible = s.visible.or(ch.visible);
        ch.fade_time = s.fade_time.or(ch.fade_time);
        ch.mute_on = s.mute_on.or(ch.mute_on);
        ch.input_gain = s.input_gain.or(ch.input_gain);
        ch.input_selector = s.input_selector.or(ch.input_selector);
    }

    /// Label and fade time don't count; preset only when both sides know it
    fn diff_address_states(
        &self,
        a: &AddressState<SisyfosChannel>,
        b: &AddressState<SisyfosChannel>,
    ) -> bool {
        let (a, b) = (&a.state, &b.state);
        a.fader_level != b.fader_level
            || a.pgm_on != b.pgm_on
            || (a.pst_on.is_some() && b.pst_on.is_some() && a.pst_on != b.pst_on)
            || a.visible != b.visible
            || a.mute_on != b.mute_on
            || a.input_gain != b.input_gain
            || a.input_selector != b.input_selector
    }
}
